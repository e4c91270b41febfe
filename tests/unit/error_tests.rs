//! Unit tests for error display and conversions.

use chat_fleet::AppError;

#[test]
fn display_prefixes_variant() {
    assert_eq!(
        AppError::InvalidArgument("blank resource".into()).to_string(),
        "invalid argument: blank resource"
    );
    assert_eq!(
        AppError::Unavailable("store down".into()).to_string(),
        "unavailable: store down"
    );
    assert_eq!(AppError::Launch("no such file".into()).to_string(), "launch: no such file");
    assert_eq!(AppError::NotFound("worker w1".into()).to_string(), "not found: worker w1");
}

#[test]
fn toml_error_maps_to_config() {
    let err = toml::from_str::<toml::Value>("x = [").expect_err("invalid toml");
    assert!(matches!(AppError::from(err), AppError::Config(_)));
}

#[test]
fn json_error_maps_to_serialization() {
    let err = serde_json::from_str::<serde_json::Value>("{").expect_err("invalid json");
    assert!(matches!(AppError::from(err), AppError::Serialization(_)));
}

#[test]
fn closed_pool_maps_to_unavailable() {
    assert!(matches!(
        AppError::from(sqlx::Error::PoolClosed),
        AppError::Unavailable(_)
    ));
    assert!(matches!(
        AppError::from(sqlx::Error::RowNotFound),
        AppError::Db(_)
    ));
}
