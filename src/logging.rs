use std::io::Write;

use chrono::Local;
use log::LevelFilter;

/// Installs `env_logger` with a local timestamp. `RUST_LOG` takes precedence
/// over `level`. Calling it twice is harmless.
pub fn init(level: LevelFilter) {
    let result = env_logger::Builder::new()
        .filter_level(level)
        .parse_env("RUST_LOG")
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();

    if result.is_ok() {
        log::info!("Logging initialized");
    }
}
