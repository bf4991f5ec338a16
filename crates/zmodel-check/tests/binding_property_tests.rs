use proptest::prelude::*;
use zmodel_check::attributes::{bind_arguments, BindError};
use zmodel_dsl::ast::{Document, ExprKind, Literal};
use zmodel_dsl::parse_document;

const DECL: &str = "attribute @@probe(_ a: Int, _ b: Int, c: Int?, d: Int?, e: Int?)";

fn document(args: &[String]) -> Document {
    let src = format!(
        "{DECL}\nmodel M {{ id Int @id\n @@probe({}) }}",
        args.join(", ")
    );
    parse_document(&src).expect("parse")
}

fn number(doc: &Document, param: &str) -> Option<String> {
    let decl = doc.attribute_decls().next()?;
    let app = &doc.models().next()?.attributes[0];
    let bound = bind_arguments(decl, app).ok()?;
    match &bound.get(param)?.kind {
        ExprKind::Literal(Literal::Number(n)) => Some(n.clone()),
        _ => None,
    }
}

fn named_args() -> impl Strategy<Value = Vec<(String, u32)>> {
    (
        proptest::option::of(0u32..100),
        proptest::option::of(0u32..100),
        proptest::option::of(0u32..100),
    )
        .prop_map(|(c, d, e)| {
            [("c", c), ("d", d), ("e", e)]
                .into_iter()
                .filter_map(|(n, v)| v.map(|v| (n.to_string(), v)))
                .collect::<Vec<_>>()
        })
        .prop_shuffle()
}

proptest! {
    #[test]
    fn named_argument_order_does_not_matter(
        a in 0u32..100,
        b in 0u32..100,
        named in named_args(),
        split in 0usize..4,
    ) {
        // Interleave the named arguments around the positional ones.
        let split = split.min(named.len());
        let mut args: Vec<String> = named[..split].iter().map(|(n, v)| format!("{n}: {v}")).collect();
        args.push(a.to_string());
        args.push(b.to_string());
        args.extend(named[split..].iter().map(|(n, v)| format!("{n}: {v}")));

        let doc = document(&args);
        prop_assert_eq!(number(&doc, "a"), Some(a.to_string()));
        prop_assert_eq!(number(&doc, "b"), Some(b.to_string()));
        for (name, value) in &named {
            prop_assert_eq!(number(&doc, name), Some(value.to_string()));
        }
    }

    #[test]
    fn binding_a_parameter_twice_always_fails(
        dup in prop_oneof![Just("a"), Just("b"), Just("c")],
        named_first in any::<bool>(),
    ) {
        let mut args = vec!["1".to_string(), "2".to_string()];
        if dup == "c" {
            args.push("c: 3".to_string());
        }
        let extra = format!("{dup}: 9");
        if named_first {
            args.insert(0, extra);
        } else {
            args.push(extra);
        }

        let doc = document(&args);
        let decl = doc.attribute_decls().next().expect("decl");
        let app = &doc.models().next().expect("model").attributes[0];
        let errors = bind_arguments(decl, app).expect_err("duplicate must fail");
        let rejected = errors.iter().any(|e| matches!(e, BindError::AlreadyProvided { .. })
            || matches!(e, BindError::UnexpectedUnnamed { .. }));
        prop_assert!(rejected);
    }
}
