pub mod access_validator;
