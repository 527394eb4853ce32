//! End-to-end tests of per-column type conversion.

use async_sqlite_manager::db::{build_row_converter, convert_default, convert_to};
use async_sqlite_manager::models::{QueryParam, QueryRequest, ReturnShape, TypeTag, Value};
use async_sqlite_manager::{Manager, ManagerConfig};

async fn setup() -> Manager {
    let manager = Manager::new(ManagerConfig::default());
    manager.connect(":memory:", Some("db"), false).await.unwrap();
    for sql in [
        "CREATE TABLE t (id INTEGER, flag TEXT)",
        "INSERT INTO t VALUES (1, '1')",
    ] {
        manager
            .execute("db", QueryRequest::new(sql).with_shape(ReturnShape::None))
            .await
            .unwrap();
    }
    manager
}

#[tokio::test]
async fn test_bool_tag_on_text_column() {
    let manager = setup().await;
    let tags = TypeTag::parse_sequence(["none", "bool"]).unwrap();
    let out = manager
        .execute(
            "db",
            QueryRequest::new("SELECT id, flag FROM t")
                .with_shape("fetchone".parse().unwrap())
                .with_column_types(tags),
        )
        .await
        .unwrap();
    assert_eq!(out.first(), Some(&vec![Value::Integer(1), Value::Bool(true)]));
}

#[tokio::test]
async fn test_untagged_never_becomes_bool() {
    let manager = setup().await;
    let out = manager
        .execute(
            "db",
            QueryRequest::new("SELECT id, flag FROM t").with_shape(ReturnShape::One),
        )
        .await
        .unwrap();
    // Integer-looking text converts through the default rule, never to bool.
    assert_eq!(out.first(), Some(&vec![Value::Integer(1), Value::Integer(1)]));
}

#[tokio::test]
async fn test_explicit_none_tag_keeps_text() {
    let manager = setup().await;
    let out = manager
        .execute(
            "db",
            QueryRequest::new("SELECT flag, flag FROM t")
                .with_shape(ReturnShape::One)
                .with_column_types(vec![None]),
        )
        .await
        .unwrap();
    // First column opts out of conversion, the second has no tag at all.
    assert_eq!(
        out.first(),
        Some(&vec![Value::Text("1".into()), Value::Integer(1)])
    );
}

#[tokio::test]
async fn test_non_integer_text_untouched() {
    let manager = setup().await;
    let out = manager
        .execute(
            "db",
            QueryRequest::new("SELECT '0x1F', '1.5', '007', 'abc', NULL").with_shape(ReturnShape::One),
        )
        .await
        .unwrap();
    assert_eq!(
        out.first(),
        Some(&vec![
            Value::Text("0x1F".into()),
            Value::Text("1.5".into()),
            Value::Text("007".into()),
            Value::Text("abc".into()),
            Value::Null,
        ])
    );
}

#[tokio::test]
async fn test_int_and_float_tags() {
    let manager = setup().await;
    let out = manager
        .execute(
            "db",
            QueryRequest::new("SELECT ' 42 ', '2.5', 'nope', NULL")
                .with_shape(ReturnShape::One)
                .with_column_types(vec![
                    Some(TypeTag::Int),
                    Some(TypeTag::Float),
                    Some(TypeTag::Int),
                    Some(TypeTag::Bool),
                ]),
        )
        .await
        .unwrap();
    assert_eq!(
        out.first(),
        Some(&vec![
            Value::Integer(42),
            Value::Real(2.5),
            Value::Text("nope".into()),
            Value::Null,
        ])
    );
}

#[tokio::test]
async fn test_fetch_many_limits_rows() {
    let manager = setup().await;
    manager
        .execute(
            "db",
            QueryRequest::new("INSERT INTO t VALUES (?, ?)")
                .with_params(vec![
                    vec![QueryParam::Int(2), QueryParam::from("0")],
                    vec![QueryParam::Int(3), QueryParam::from("true")],
                ])
                .with_shape(ReturnShape::None),
        )
        .await
        .unwrap();

    let out = manager
        .execute(
            "db",
            QueryRequest::new("SELECT flag FROM t ORDER BY id")
                .with_shape("2".parse().unwrap())
                .with_column_types(vec![Some(TypeTag::Bool)]),
        )
        .await
        .unwrap();
    assert_eq!(
        out.into_rows(),
        Some(vec![vec![Value::Bool(true)], vec![Value::Bool(false)]])
    );
}

#[test]
fn test_row_converter_without_tags_matches_default() {
    let row = vec![
        Value::Text("12".into()),
        Value::Text("x".into()),
        Value::Integer(3),
        Value::Null,
        Value::Real(0.5),
    ];
    let expected: Vec<Value> = row.iter().cloned().map(convert_default).collect();
    assert_eq!(build_row_converter(None).convert(row.clone()), expected);
    assert_eq!(build_row_converter(Some(&[])).convert(row), expected);
}

#[test]
fn test_bool_strings() {
    for s in ["1", "true", "True", "TRUE"] {
        assert_eq!(convert_to(Value::Text(s.into()), Some(TypeTag::Bool)), Value::Bool(true));
    }
    for s in ["0", "false", "False", "FALSE", ""] {
        assert_eq!(convert_to(Value::Text(s.into()), Some(TypeTag::Bool)), Value::Bool(false));
    }
    assert_eq!(
        convert_to(Value::Text("maybe".into()), Some(TypeTag::Bool)),
        Value::Text("maybe".into())
    );
}

#[test]
fn test_malformed_tag_sequence() {
    assert!(TypeTag::parse_sequence(["int", "decimal"]).is_err());
    assert!("fetch_some".parse::<ReturnShape>().is_err());
}
