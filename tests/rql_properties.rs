//! Property tests for RQL parsing and SQL translation

use custodian_core::node::Node;
use custodian_core::*;
use proptest::prelude::*;

const CHAIN: usize = 4;

/// m0 -> m1 -> ... -> m4 through `next` links, every meta with a `label`
fn chain_registry() -> MetaRegistry {
    let registry = MetaRegistry::new();
    let descriptions = (0..=CHAIN)
        .map(|i| {
            let mut description = MetaDescription::new(&format!("m{}", i), "id")
                .with_field(FieldSpec::key("id"))
                .with_field(FieldSpec::new("label", FieldType::String).optional());
            if i < CHAIN {
                description = description.with_field(FieldSpec::object("next", &format!("m{}", i + 1)).optional());
            }
            description
        })
        .collect();
    registry.create_many(descriptions).unwrap();
    registry
}

fn translate(registry: &MetaRegistry, rql: &str) -> Result<SqlQuery> {
    let root = Node::query_root(registry.require_meta("m0")?);
    let query = RqlParser::parse(rql)?;
    SqlTranslator::new(registry, "o_").translate(&query, &root)
}

proptest! {
    #[test]
    fn prop_parser_never_panics(input in "\\PC{0,40}") {
        let _ = RqlParser::parse(&input);
    }

    #[test]
    fn prop_eq_on_key_binds_one_value(key in 0i64..1_000_000) {
        let registry = chain_registry();
        let sql = translate(&registry, &format!("eq(id,{})", key)).unwrap();
        prop_assert_eq!(sql.where_clause, "m.\"id\" =$1".to_string());
        prop_assert_eq!(sql.binds, vec![Value::Int(key)]);
    }

    #[test]
    fn prop_in_binds_every_item(keys in prop::collection::vec(0i64..1000, 1..8)) {
        let registry = chain_registry();
        let items: Vec<String> = keys.iter().map(i64::to_string).collect();
        let sql = translate(&registry, &format!("in(id,({}))", items.join(","))).unwrap();
        prop_assert_eq!(sql.binds.len(), keys.len());
        let tail = format!("${})", keys.len());
        prop_assert!(sql.where_clause.ends_with(&tail));
    }

    #[test]
    fn prop_exists_per_relation_hop(hops in 1usize..=CHAIN) {
        let registry = chain_registry();
        let path = format!("{}label", "next.".repeat(hops));
        let sql = translate(&registry, &format!("eq({},x)", path)).unwrap();
        prop_assert_eq!(sql.where_clause.matches("EXISTS").count(), hops);
        prop_assert_eq!(sql.binds, vec![Value::String("x".into())]);
    }

    #[test]
    fn prop_paging_is_kept(limit in 1usize..500, offset in 0usize..500) {
        let registry = chain_registry();
        let sql = translate(&registry, &format!("limit({},{})", limit, offset)).unwrap();
        prop_assert_eq!(sql.limit, Some(limit));
        prop_assert_eq!(sql.offset, Some(offset));
    }
}
