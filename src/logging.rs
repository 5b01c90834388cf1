use log::LevelFilter;

/// Installs the process logger. `RUST_LOG` overrides `level`. Calling this more than once is
/// harmless.
pub fn init_logging(level: LevelFilter) {
    env_logger::Builder::new().filter(None, level).parse_default_env().try_init().ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init_logging(LevelFilter::Debug);
        init_logging(LevelFilter::Warn);
        log::debug!("logger still usable");
    }
}
