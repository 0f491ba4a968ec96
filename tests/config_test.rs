//! Configuration loading tests
//!
//! Loads YAML files from disk with environment expansion and checks the
//! adapter settings derived from them.

#[cfg(test)]
mod tests {
    use resumable_uploadr::config::{Config, ConfigError};
    use resumable_uploadr::upload::{UploadHooks, UploadMethod};
    use resumable_uploadr::UploadDispatcher;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_full_config() {
        std::env::set_var("UPLOADR_CONFIG_TEST_TOKEN", "s3cr3t");
        let file = write_config(
            r#"
endpoints:
  chunked: "https://files.example.com/upload"
  tus: "https://files.example.com/tus"
  multipart: "https://files.example.com/form"
method: tus
tus_threshold: 20971520
chunk_size: 2097152
max_retries: 5
retry: true
retry_delay_ms: 250
timeout_secs: 60
max_concurrent_chunks: 8
metadata:
  project: demo
headers:
  Authorization: "Bearer ${UPLOADR_CONFIG_TEST_TOKEN}"
"#,
        );

        let config = Config::load(file.path()).unwrap();
        std::env::remove_var("UPLOADR_CONFIG_TEST_TOKEN");

        assert_eq!(config.method, Some(UploadMethod::Tus));
        assert_eq!(config.tus_threshold, 20 * 1024 * 1024);
        assert_eq!(config.headers["Authorization"], "Bearer s3cr3t");

        let tus = config.tus_config().unwrap();
        assert_eq!(tus.endpoint, "https://files.example.com/tus");
        assert_eq!(tus.chunk_size, 2 * 1024 * 1024);
        assert_eq!(tus.retry.max_retries, 5);
        assert_eq!(tus.retry.base_delay, Duration::from_millis(250));
        assert_eq!(tus.timeout, Duration::from_secs(60));
        assert_eq!(tus.metadata["project"], "demo");

        let chunked = config.chunked_config().unwrap();
        assert_eq!(chunked.max_concurrent_chunks, Some(8));

        let multipart = config.multipart_config().unwrap();
        assert_eq!(multipart.headers["Authorization"], "Bearer s3cr3t");

        let dispatcher = UploadDispatcher::from_config(&config, UploadHooks::new()).unwrap();
        assert_eq!(dispatcher.method(), Some(UploadMethod::Tus));
    }

    #[test]
    fn test_per_protocol_chunk_defaults() {
        let file = write_config(
            r#"
endpoints:
  rest: "http://localhost:8080/upload"
  tus: "http://localhost:1080/files"
"#,
        );
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.chunked_config().unwrap().chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.tus_config().unwrap().chunk_size, 1024 * 1024);
        assert_eq!(config.timeout(), Duration::from_secs(300));
        assert!(config.retry_policy().enabled);
    }

    #[test]
    fn test_method_alias() {
        let config = Config::from_yaml(
            "endpoints:\n  chunked: \"http://localhost/upload\"\nmethod: rest\n",
        )
        .unwrap();
        assert_eq!(config.method, Some(UploadMethod::Chunked));
    }

    #[test]
    fn test_env_default_for_endpoint() {
        let config = Config::from_yaml(
            "endpoints:\n  tus: \"${UPLOADR_UNSET_ENDPOINT:-http://localhost:1080/files}\"\n",
        )
        .unwrap();
        assert_eq!(
            config.endpoints.tus.as_deref(),
            Some("http://localhost:1080/files")
        );
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load("/nonexistent/uploadr.yaml");
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let cases = [
            "max_retries: 3\n",
            "endpoints:\n  tus: \"not a url\"\n",
            "endpoints:\n  tus: \"http://localhost/files\"\nmethod: multipart\n",
            "endpoints:\n  tus: \"http://localhost/files\"\nchunk_size: 0\n",
            "endpoints:\n  tus: \"http://localhost/files\"\ntimeout_secs: 0\n",
            "endpoints:\n  chunked: \"http://localhost/u\"\nmax_concurrent_chunks: 0\n",
        ];
        for yaml in cases {
            let result = Config::from_yaml(yaml);
            assert!(
                matches!(result, Err(ConfigError::ValidationError(_))),
                "accepted: {}",
                yaml
            );
        }

        let result = Config::from_yaml("endpoints:\n  tus: \"http://x\"\nmethod: ftp\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
