pub mod feed_provider;
