use std::sync::Arc;

use medivoice::audio::AudioBackends;
use medivoice::config::native_name;
use medivoice::{Config, SessionController, WsTransport};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置 (config.toml + 环境变量覆盖)
    let config = Config::new()?.with_env_overrides()?;
    let api_key = config.api_key()?;

    println!(
        "{} v{} | language: {} ({}) | voice: {}",
        config.app_name,
        config.app_version,
        config.language,
        native_name(&config.language).unwrap_or("?"),
        config.voice,
    );

    let transport = Arc::new(WsTransport::new(config.ws_url.clone(), api_key));
    let backends = AudioBackends::alsa(&config.audio_config());
    let mut controller = SessionController::new(config.session_settings(), backends, transport);

    // 状态输出
    let mut status_rx = controller.subscribe();
    tokio::spawn(async move {
        let mut last = medivoice::SessionStatus::default();
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            if status.state != last.state {
                println!("[{}]", status.state);
            }
            if status.agent_speaking != last.agent_speaking {
                println!("{}", if status.agent_speaking { "Agent speaking..." } else { "Listening..." });
            }
            if status.activity.last() != last.activity.last() {
                if let Some(entry) = status.activity.last() {
                    println!("  > {}", entry);
                }
            }
            if status.last_error != last.last_error {
                if let Some(message) = &status.last_error {
                    eprintln!("{}", message);
                }
            }
            last = status;
        }
    });

    if let Err(e) = controller.start().await {
        tokio::task::yield_now().await;
        return Err(e.into());
    }

    controller
        .run_until(async {
            let _ = signal::ctrl_c().await;
            println!("Received Ctrl+C, shutting down...");
        })
        .await;

    controller.stop();
    // 等待状态输出
    tokio::task::yield_now().await;
    Ok(())
}
