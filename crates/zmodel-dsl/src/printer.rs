//! Canonical source printer.
//!
//! `parse_document(&print_document(doc))` is structurally equal to `doc`
//! (spans aside). Output is normalised: four-space indentation, one blank
//! line between declarations, double-quoted strings, and binary operators
//! surrounded by single spaces. Parentheses are emitted only where operator
//! precedence requires them.

use crate::ast::{
    Argument, AttributeApp, AttributeDecl, ConfigBlock, DataModel, Declaration, Document,
    EnumDecl, Expr, ExprKind, FunctionDecl, Literal, TypeName, TypeSpec,
};

const INDENT: &str = "    ";

pub fn print_document(document: &Document) -> String {
    document
        .declarations
        .iter()
        .map(format_declaration)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn print_expression(expr: &Expr) -> String {
    let mut out = String::new();
    write_expr(&mut out, expr, 0);
    out
}

fn format_declaration(declaration: &Declaration) -> String {
    match declaration {
        Declaration::DataSource(block) => format_config_block("datasource", block),
        Declaration::Plugin(block) => format_config_block("plugin", block),
        Declaration::Enum(decl) => format_enum(decl),
        Declaration::Model(model) => format_model(model),
        Declaration::Function(function) => format_function(function),
        Declaration::Attribute(attribute) => format_attribute_decl(attribute),
    }
}

fn format_config_block(keyword: &str, block: &ConfigBlock) -> String {
    let mut out = format!("{keyword} {} {{\n", block.name);
    for field in &block.fields {
        out.push_str(&format!(
            "{INDENT}{} = {}\n",
            field.name,
            print_expression(&field.value)
        ));
    }
    out.push_str("}\n");
    out
}

fn format_enum(decl: &EnumDecl) -> String {
    let mut out = format!("enum {} {{\n", decl.name);
    for member in &decl.members {
        out.push_str(&format!(
            "{INDENT}{}{}\n",
            member.name,
            trailing_attributes(&member.attributes)
        ));
    }
    if !decl.members.is_empty() && !decl.attributes.is_empty() {
        out.push('\n');
    }
    for attribute in &decl.attributes {
        out.push_str(&format!("{INDENT}{}\n", format_attribute(attribute)));
    }
    out.push_str("}\n");
    out
}

fn format_model(model: &DataModel) -> String {
    let mut header = String::new();
    if model.is_abstract {
        header.push_str("abstract ");
    }
    header.push_str(&format!("model {}", model.name));
    if !model.extends.is_empty() {
        let bases: Vec<&str> = model.extends.iter().map(|b| b.as_str()).collect();
        header.push_str(&format!(" extends {}", bases.join(", ")));
    }

    let mut out = format!("{header} {{\n");
    for field in &model.fields {
        out.push_str(&format!(
            "{INDENT}{} {}{}\n",
            field.name,
            format_type(&field.ty),
            trailing_attributes(&field.attributes)
        ));
    }
    if !model.fields.is_empty() && !model.attributes.is_empty() {
        out.push('\n');
    }
    for attribute in &model.attributes {
        out.push_str(&format!("{INDENT}{}\n", format_attribute(attribute)));
    }
    out.push_str("}\n");
    out
}

fn format_function(function: &FunctionDecl) -> String {
    let params: Vec<String> = function
        .params
        .iter()
        .map(|p| format!("{}: {}", p.name, format_type(&p.ty)))
        .collect();
    let signature = format!(
        "function {}({}): {}",
        function.name,
        params.join(", "),
        format_type(&function.return_type)
    );
    match &function.body {
        Some(body) => format!("{signature} {{\n{INDENT}{}\n}}\n", print_expression(body)),
        None => format!("{signature} {{}}\n"),
    }
}

fn format_attribute_decl(decl: &AttributeDecl) -> String {
    let params: Vec<String> = decl
        .params
        .iter()
        .map(|p| {
            let marker = if p.positional { "_ " } else { "" };
            format!("{marker}{}: {}", p.name, format_type(&p.ty))
        })
        .collect();
    format!(
        "attribute {}({}){}\n",
        decl.name,
        params.join(", "),
        trailing_attributes(&decl.meta)
    )
}

fn trailing_attributes(attributes: &[AttributeApp]) -> String {
    attributes
        .iter()
        .map(|a| format!(" {}", format_attribute(a)))
        .collect()
}

fn format_attribute(attribute: &AttributeApp) -> String {
    if attribute.args.is_empty() {
        attribute.name.name.clone()
    } else {
        format!("{}({})", attribute.name, format_arguments(&attribute.args))
    }
}

fn format_arguments(args: &[Argument]) -> String {
    args.iter()
        .map(|arg| match arg {
            Argument::Positional { value } => print_expression(value),
            Argument::Named { name, value } => format!("{name}: {}", print_expression(value)),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn format_type(ty: &TypeSpec) -> String {
    let mut out = match &ty.name {
        TypeName::Scalar(kind) => kind.as_str().to_string(),
        TypeName::Builtin(builtin) => builtin.as_str().to_string(),
        TypeName::Unsupported(text) => format!("Unsupported({})", quote(text)),
        TypeName::Named(ident) => ident.name.clone(),
    };
    if ty.is_array {
        out.push_str("[]");
    }
    if ty.is_optional {
        out.push('?');
    }
    out
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Writes `expr`, parenthesised when it binds looser than `min_precedence`.
fn write_expr(out: &mut String, expr: &Expr, min_precedence: u8) {
    let parens = expr.precedence() < min_precedence;
    if parens {
        out.push('(');
    }
    match &expr.kind {
        ExprKind::Literal(literal) => match literal {
            Literal::String(text) => out.push_str(&quote(text)),
            Literal::Number(text) => out.push_str(text),
            Literal::Boolean(value) => out.push_str(if *value { "true" } else { "false" }),
            Literal::Null => out.push_str("null"),
        },
        ExprKind::This => out.push_str("this"),
        ExprKind::Reference(ident) => out.push_str(ident.as_str()),
        ExprKind::MemberAccess { object, member } => {
            write_expr(out, object, 8);
            out.push('.');
            out.push_str(member.as_str());
        }
        ExprKind::Unary { op, operand } => {
            out.push_str(op.symbol());
            write_expr(out, operand, 7);
        }
        ExprKind::Binary { op, left, right } => {
            // Left-associative: the right operand needs strictly tighter binding.
            write_expr(out, left, op.precedence());
            out.push_str(&format!(" {} ", op.symbol()));
            write_expr(out, right, op.precedence() + 1);
        }
        ExprKind::Invocation { function, args } => {
            out.push_str(&format!("{function}({})", format_arguments(args)));
        }
        ExprKind::Array(items) => {
            let items: Vec<String> = items.iter().map(print_expression).collect();
            out.push_str(&format!("[{}]", items.join(", ")));
        }
        ExprKind::CollectionPredicate {
            collection,
            quantifier,
            condition,
        } => {
            write_expr(out, collection, 8);
            out.push(quantifier.symbol());
            out.push('[');
            write_expr(out, condition, 0);
            out.push(']');
        }
    }
    if parens {
        out.push(')');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_document, parse_expression};

    fn roundtrip_expr(text: &str) -> String {
        print_expression(&parse_expression(text).expect("parse"))
    }

    #[test]
    fn normalises_operator_spacing_and_quotes() {
        assert_eq!(roundtrip_expr("a<b"), "a < b");
        assert_eq!(roundtrip_expr("x=='y'"), "x == \"y\"");
        assert_eq!(roundtrip_expr("!a&&-b>1"), "!a && -b > 1");
    }

    #[test]
    fn keeps_only_required_parentheses() {
        assert_eq!(roundtrip_expr("(a || b) && c"), "(a || b) && c");
        assert_eq!(roundtrip_expr("a || (b && c)"), "a || b && c");
        assert_eq!(roundtrip_expr("a - (b - c)"), "a - (b - c)");
        assert_eq!(roundtrip_expr("(a - b) - c"), "a - b - c");
        assert_eq!(roundtrip_expr("!(a == b)"), "!(a == b)");
        assert_eq!(roundtrip_expr("(-a)?[b]"), "(-a)?[b]");
    }

    #[test]
    fn prints_postfix_forms_compactly() {
        assert_eq!(
            roundtrip_expr("posts ? [ author == auth() ]"),
            "posts?[author == auth()]"
        );
        assert_eq!(roundtrip_expr("auth().profile.name"), "auth().profile.name");
        assert_eq!(roundtrip_expr("[a(sort: Desc),b]"), "[a(sort: Desc), b]");
    }

    #[test]
    fn prints_a_canonical_document() {
        let src = r#"
datasource db { provider = 'sqlite'
url = env('DB') }
enum Role { USER ADMIN @@map('roles') }
abstract model Base { id String @id @default(uuid()) }
model Post extends Base {
  title String?
  tags String[]
  @@allow('read', true)
}
function isOwner(p: Post): Boolean {}
attribute @@custom(_ name: String, flag: Boolean?) @@@targetField([StringField])
"#;
        let printed = print_document(&parse_document(src).expect("parse"));
        let expected = r#"datasource db {
    provider = "sqlite"
    url = env("DB")
}

enum Role {
    USER
    ADMIN

    @@map("roles")
}

abstract model Base {
    id String @id @default(uuid())
}

model Post extends Base {
    title String?
    tags String[]

    @@allow("read", true)
}

function isOwner(p: Post): Boolean {}

attribute @@custom(_ name: String, flag: Boolean?) @@@targetField([StringField])
"#;
        assert_eq!(printed, expected);
    }

    #[test]
    fn printing_is_idempotent() {
        let src = "model A { id Int @id\n loc Unsupported(\"geo \\\"x\\\"\")?\n}";
        let once = print_document(&parse_document(src).expect("parse"));
        let twice = print_document(&parse_document(&once).expect("reparse"));
        assert_eq!(once, twice);
    }
}
