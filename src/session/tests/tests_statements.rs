#[cfg(test)]
mod statement_tests {
    use crate::session::{PreparedStatement, Request, StatementKind, Value};

    #[test]
    fn kind_from_leading_keyword() {
        assert_eq!(StatementKind::of("INSERT INTO t (k) VALUES (?)"), StatementKind::Insert);
        assert_eq!(StatementKind::of("  update t SET v = ?"), StatementKind::Update);
        assert_eq!(StatementKind::of("select * from t"), StatementKind::Select);
        assert_eq!(StatementKind::of("DELETE FROM t WHERE k = ?"), StatementKind::Delete);
        assert_eq!(StatementKind::of("CREATE TABLE t (k text)"), StatementKind::Schema);
        assert_eq!(StatementKind::of("drop table t"), StatementKind::Schema);
        assert_eq!(StatementKind::of("BEGIN BATCH"), StatementKind::Other);
        assert_eq!(StatementKind::of(""), StatementKind::Other);
    }

    #[test]
    fn bind_keeps_values_and_routing_key() {
        let stmt = PreparedStatement::new("INSERT INTO kv (k, v) VALUES (?, ?)");
        let bound = stmt
            .bind(vec![Value::from("a"), Value::from(7i64)])
            .with_routing_key("a");

        assert_eq!(bound.statement().query(), stmt.query());
        assert_eq!(bound.values(), &[Value::Text("a".into()), Value::Int(7)]);
        assert_eq!(bound.routing_key(), Some("a"));
        assert_eq!(Request::Bound(bound).kind(), StatementKind::Insert);
    }

    #[test]
    fn simple_request_kind() {
        let request = Request::Simple("DROP TABLE IF EXISTS t".into());
        assert_eq!(request.kind(), StatementKind::Schema);
    }

    #[test]
    fn value_accessors() {
        assert_eq!(Value::from("x").as_text(), Some("x"));
        assert_eq!(Value::from(3i64).as_int(), Some(3));
        assert_eq!(Value::Null.as_text(), None);
        assert_eq!(Value::from(true).as_int(), None);
    }
}
