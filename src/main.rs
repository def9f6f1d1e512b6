use tokio_util::sync::CancellationToken;

mod config;
mod session;
mod source;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("codec_bus", log::LevelFilter::Debug)
        .filter_module("codec_relay", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    #[cfg(feature = "ffmpeg")]
    codec_bus::ffmpeg::init()?;
    let config = config::config();

    let cancel = CancellationToken::new();
    let handle = tokio::runtime::Handle::current();
    let mut session = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || session::run(config, cancel, handle))
    };

    let metrics = loop {
        tokio::select! {
            result = &mut session => {
                break result??;
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, stopping session");
                cancel.cancel();
            },
        }
    };

    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
