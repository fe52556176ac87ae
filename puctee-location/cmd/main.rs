use anyhow::Result;
use puctee_core::{init_tracing_from_config, load_config};
use puctee_location::service::ApplicationBootstrap;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let app_config = load_config(Some("config"));
    init_tracing_from_config(Some(&app_config.logging));

    // 创建应用上下文并驻留运行
    ApplicationBootstrap::run(app_config).await
}
