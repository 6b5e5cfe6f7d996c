use super::*;

#[test]
fn defaults_are_loopback_and_standard_port() {
    let options = ProxyOptions::default();
    assert_eq!(options.listen_address, "127.0.0.1");
    assert_eq!(options.listen_port, 7865);
    assert!(!options.intercept_https);
}

#[test]
fn load_falls_back_to_defaults_when_file_absent() {
    let path = std::path::Path::new("/nonexistent/snitcher-config-test.toml");
    let options = ProxyOptions::load(path).unwrap();
    assert_eq!(options.listen_port, 7865);
}

#[test]
fn validate_rejects_zero_port() {
    let mut options = ProxyOptions::default();
    options.listen_port = 0;
    assert!(options.validate().is_err());
}

#[test]
fn parses_from_toml() {
    let toml_str = r#"
        listen_address = "0.0.0.0"
        listen_port = 9999
        intercept_https = true
    "#;
    let options: ProxyOptions = toml::from_str(toml_str).unwrap();
    assert_eq!(options.listen_address, "0.0.0.0");
    assert_eq!(options.listen_port, 9999);
    assert!(options.intercept_https);
    // dial_timeout_secs omitted in the TOML, so the serde default applies.
    assert_eq!(options.dial_timeout_secs, 10.0);
}
