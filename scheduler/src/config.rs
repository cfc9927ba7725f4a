use std::time::Duration;

/// Process configuration, read once at startup. The build timeout and the
/// pool poll interval flow into the dispatcher and pool constructors
/// explicitly; nothing reads the environment after startup.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub nats_url: String,
    pub build_stream: String,
    pub build_subject: String,
    pub build_consumer: String, // default: build-scheduler
    pub build_timeout: Duration,
    pub poll_interval: Duration,
    pub requeue_delay: Duration,
    pub pull_timeout: Duration,
    pub port: u16,
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            nats_url: std::env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string()),
            build_stream: std::env::var("BUILD_STREAM").unwrap_or_else(|_| "BUILDS".to_string()),
            build_subject: std::env::var("BUILD_SUBJECT")
                .unwrap_or_else(|_| "builds.v1.requests".to_string()),
            build_consumer: std::env::var("BUILD_CONSUMER")
                .unwrap_or_else(|_| "build-scheduler".to_string()),
            build_timeout: Duration::from_secs(env_u64("BUILD_TIMEOUT_SECONDS", 1200)),
            poll_interval: Duration::from_secs(env_u64("POOL_POLL_SECONDS", 60)),
            requeue_delay: Duration::from_millis(env_u64("BUILD_REQUEUE_DELAY_MS", 5000)),
            pull_timeout: Duration::from_millis(env_u64("PULL_TIMEOUT_MS", 1500)),
            port: env_u16("PORT", 8080),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_apply_without_environment() {
        std::env::remove_var("BUILD_TIMEOUT_SECONDS");
        std::env::remove_var("POOL_POLL_SECONDS");

        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.build_timeout, Duration::from_secs(1200));
        assert_eq!(cfg.poll_interval, Duration::from_secs(60));
        assert_eq!(cfg.build_consumer, "build-scheduler");
    }

    #[test]
    #[serial]
    fn out_of_range_port_falls_back_to_default() {
        std::env::set_var("PORT", "70000");
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.port, 8080);

        std::env::set_var("PORT", "9090");
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.port, 9090);
        std::env::remove_var("PORT");
    }

    #[test]
    #[serial]
    fn environment_overrides_timeout() {
        std::env::set_var("BUILD_TIMEOUT_SECONDS", "45");
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.build_timeout, Duration::from_secs(45));
        std::env::remove_var("BUILD_TIMEOUT_SECONDS");
    }
}
