// author: kodeholic (powered by Claude)

use clap::Parser;
use televisit_signal::{config, run_server, ServerArgs};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name  = "tvserver",
    about = "televisit-signal 시그널링 릴레이 서버",
    version,
)]
struct Cli {
    /// WS/HTTP 공용 포트
    #[arg(long, default_value_t = config::SIGNALING_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() {
    // 환경 변수 기반 로깅 초기화 (기본값: info)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    run_server(ServerArgs { port: cli.port }).await;
}
