use arcor_domain::config::Config;

#[test]
fn default_ports_match_deployment_layout() {
    let config = Config::default();
    assert_eq!(config.server.port, 6789);
    assert_eq!(config.execution.port, 6790);
    assert!(config.services.build_url.ends_with(":5008"));
    assert!(config.services.persistence_url.ends_with(":11000"));
    assert!(config.services.scene_service_url.ends_with(":5013"));
}

#[test]
fn explicit_values_parse() {
    let toml_str = r#"
[server]
port = 7000
lock_release_secs = 10

[services]
build_url = "http://build.local:5008"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.server.port, 7000);
    assert_eq!(config.server.lock_release_secs, 10);
    assert_eq!(config.services.build_url, "http://build.local:5008");
    // Untouched sections keep their defaults.
    assert_eq!(config.execution.stop_deadline_secs, 5);
    assert_eq!(config.catalog.listing_ttl_ms, 1_000);
}

#[test]
fn validate_flags_bad_urls() {
    let mut config = Config::default();
    config.services.build_url = "ftp://nope".into();
    let issues = config.validate();
    assert!(issues.iter().any(|i| i.field == "services.build_url"));
}
