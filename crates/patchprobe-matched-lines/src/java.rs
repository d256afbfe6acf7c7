//! Method and constructor extraction from Java source with `tree-sitter-java`.

use std::cell::RefCell;
use std::collections::BTreeSet;

use tree_sitter::{Node, Parser, Tree};

thread_local! {
    static JAVA_PARSER: RefCell<Result<Parser, String>> = RefCell::new({
        let mut parser = Parser::new();
        match parser.set_language(tree_sitter_java::language()) {
            Ok(()) => Ok(parser),
            Err(_) => Err("tree-sitter-java language load failed".to_string()),
        }
    });
}

/// Parse Java source text with `tree-sitter-java`.
pub fn parse_java(source: &str) -> Result<Tree, String> {
    JAVA_PARSER.with(|parser_cell| {
        let mut parser = parser_cell
            .try_borrow_mut()
            .map_err(|_| "tree-sitter parser is already in use".to_string())?;
        let parser = match parser.as_mut() {
            Ok(parser) => parser,
            Err(err) => return Err(err.clone()),
        };

        parser
            .parse(source, None)
            .ok_or_else(|| "tree-sitter failed to produce a syntax tree".to_string())
    })
}

/// A method or constructor declared in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Runtime method name: the declared name, or `<init>` for constructors.
    pub name: String,
    /// `name(T1,T2)` with generic arguments erased and varargs as arrays.
    pub signature: String,
    /// Binary name of the declaring type (`pkg.Outer$Inner`).
    pub type_name: String,
    pub start_line: u32,
    pub end_line: u32,
    /// Start line of every statement in the member's body.
    pub statement_lines: BTreeSet<u32>,
}

impl Member {
    /// Whether `line` falls strictly inside the member's declaration.
    pub fn encloses(&self, line: u32) -> bool {
        self.start_line < line && line < self.end_line
    }

    pub fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR_NAME
    }
}

pub const CONSTRUCTOR_NAME: &str = "<init>";

const TYPE_DECLARATIONS: &[&str] = &[
    "class_declaration",
    "interface_declaration",
    "enum_declaration",
    "record_declaration",
];

/// Every method and constructor of the file's top-level types and their
/// nested (member) types, in source order.
pub fn members(source: &str) -> Result<Vec<Member>, String> {
    let tree = parse_java(source)?;
    let root = tree.root_node();
    if root.has_error() {
        tracing::warn!(
            target = "patchprobe.matched_lines",
            "source has syntax errors; member ranges may be incomplete"
        );
    }

    let package = package_name(source, root);
    let mut out = Vec::new();
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        if TYPE_DECLARATIONS.contains(&child.kind()) {
            collect_type(source, child, package.as_deref(), None, &mut out);
        }
    }
    Ok(out)
}

fn package_name(source: &str, root: Node<'_>) -> Option<String> {
    let package = find_named_child(root, "package_declaration")?;
    named_children(package)
        .find(|child| matches!(child.kind(), "scoped_identifier" | "identifier"))
        .map(|name| strip_whitespace(node_text(source, name)))
}

fn collect_type(
    source: &str,
    node: Node<'_>,
    package: Option<&str>,
    outer: Option<&str>,
    out: &mut Vec<Member>,
) {
    let Some(name) = node.child_by_field_name("name").map(|n| node_text(source, n)) else {
        return;
    };
    let type_name = match (outer, package) {
        (Some(outer), _) => format!("{outer}${name}"),
        (None, Some(package)) => format!("{package}.{name}"),
        (None, None) => name.to_string(),
    };
    let Some(body) = node.child_by_field_name("body") else {
        return;
    };

    for child in body_declarations(body) {
        match child.kind() {
            "method_declaration" | "constructor_declaration" | "compact_constructor_declaration" => {
                if let Some(member) = member(source, child, name, &type_name) {
                    out.push(member);
                }
            }
            kind if TYPE_DECLARATIONS.contains(&kind) => {
                collect_type(source, child, package, Some(&type_name), out);
            }
            _ => {}
        }
    }
}

/// Declarations of a type body; enum bodies keep theirs after the constants.
fn body_declarations(body: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = body.walk();
    let mut declarations = Vec::new();
    for child in body.named_children(&mut cursor) {
        if child.kind() == "enum_body_declarations" {
            let mut inner = child.walk();
            declarations.extend(child.named_children(&mut inner));
        } else {
            declarations.push(child);
        }
    }
    declarations
}

fn member(source: &str, node: Node<'_>, simple_type: &str, type_name: &str) -> Option<Member> {
    let (name, display_name, parameters) = match node.kind() {
        "method_declaration" => {
            let name = node_text(source, node.child_by_field_name("name")?).to_string();
            (name.clone(), name, node.child_by_field_name("parameters"))
        }
        "constructor_declaration" => (
            CONSTRUCTOR_NAME.to_string(),
            simple_type.to_string(),
            node.child_by_field_name("parameters"),
        ),
        // A compact canonical constructor takes the record components.
        _ => (
            CONSTRUCTOR_NAME.to_string(),
            simple_type.to_string(),
            node.parent()
                .and_then(|body| body.parent())
                .and_then(|record| record.child_by_field_name("parameters")),
        ),
    };

    let parameter_types = parameters
        .map(|parameters| parameter_types(source, parameters))
        .unwrap_or_default();
    let statement_lines = node
        .child_by_field_name("body")
        .map(statement_lines)
        .unwrap_or_default();

    Some(Member {
        name,
        signature: format!("{display_name}({})", parameter_types.join(",")),
        type_name: type_name.to_string(),
        start_line: line_of(node),
        end_line: node.end_position().row as u32 + 1,
        statement_lines,
    })
}

fn parameter_types(source: &str, parameters: Node<'_>) -> Vec<String> {
    let mut cursor = parameters.walk();
    let mut types = Vec::new();
    for parameter in parameters.named_children(&mut cursor) {
        match parameter.kind() {
            "formal_parameter" => {
                let Some(ty) = parameter.child_by_field_name("type") else {
                    continue;
                };
                let mut erased = erase_type(node_text(source, ty));
                // C-style `int values[]`.
                if let Some(dimensions) = parameter.child_by_field_name("dimensions") {
                    erased.push_str(&strip_whitespace(node_text(source, dimensions)));
                }
                types.push(erased);
            }
            "spread_parameter" => {
                let mut inner = parameter.walk();
                let ty = parameter
                    .named_children(&mut inner)
                    .find(|child| !matches!(child.kind(), "modifiers" | "annotation" | "marker_annotation"));
                if let Some(ty) = ty {
                    types.push(format!("{}[]", erase_type(node_text(source, ty))));
                }
            }
            _ => {}
        }
    }
    types
}

/// Drop generic arguments and whitespace: `Map<K, List<V>> []` becomes `Map[]`.
fn erase_type(text: &str) -> String {
    let mut depth = 0usize;
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            _ if depth > 0 || ch.is_whitespace() => {}
            _ => out.push(ch),
        }
    }
    out
}

fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|ch| !ch.is_whitespace()).collect()
}

/// Start lines of the statements in `body`: the direct children of every
/// block and switch case, plus brace-less bodies of control statements.
fn statement_lines(body: Node<'_>) -> BTreeSet<u32> {
    let mut lines = BTreeSet::new();
    visit_nodes(body, &mut |node| match node.kind() {
        "block" | "constructor_body" => push_children(node, &mut lines, false),
        "switch_block_statement_group" | "switch_rule" => push_children(node, &mut lines, true),
        "if_statement" => {
            for field in ["consequence", "alternative"] {
                push_unbraced(node.child_by_field_name(field), &mut lines);
            }
        }
        "while_statement" | "for_statement" | "enhanced_for_statement" | "do_statement" => {
            push_unbraced(node.child_by_field_name("body"), &mut lines);
        }
        _ => {}
    });
    lines
}

fn push_children(node: Node<'_>, lines: &mut BTreeSet<u32>, in_switch: bool) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        let skip = is_comment(child)
            || (in_switch && matches!(child.kind(), "switch_label" | "block"));
        if !skip {
            lines.insert(line_of(child));
        }
    }
}

fn push_unbraced(body: Option<Node<'_>>, lines: &mut BTreeSet<u32>) {
    if let Some(body) = body.filter(|body| body.kind() != "block") {
        lines.insert(line_of(body));
    }
}

fn is_comment(node: Node<'_>) -> bool {
    matches!(node.kind(), "line_comment" | "block_comment" | "comment")
}

fn line_of(node: Node<'_>) -> u32 {
    node.start_position().row as u32 + 1
}

fn visit_nodes<'a, F: FnMut(Node<'a>)>(node: Node<'a>, f: &mut F) {
    f(node);
    if node.child_count() == 0 {
        return;
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        visit_nodes(child, f);
    }
}

fn find_named_child<'a>(node: Node<'a>, kind: &str) -> Option<Node<'a>> {
    named_children(node).find(|child| child.kind() == kind)
}

/// Named children without a `TreeCursor`; the iterator borrows nothing local.
fn named_children(node: Node<'_>) -> impl Iterator<Item = Node<'_>> {
    (0..node.named_child_count()).filter_map(move |idx| node.named_child(idx))
}

fn node_text<'a>(source: &'a str, node: Node<'_>) -> &'a str {
    &source[node.byte_range()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SHAPES: &str = r#"package geo;

import java.util.List;

public class Shapes {
    private int count;

    public Shapes(int count) {
        this.count = count;
    }

    public <T> int total(List<T> items, int... extra) {
        int sum = 0; // running
        for (T item : items)
            sum++;
        if (sum > count) {
            return sum;
        } else
            sum--;
        return sum;
    }

    static class Circle {
        double radius(double[] d, String s[]) {
            switch ((int) d[0]) {
                case 1:
                    return 1.0;
                default:
                    return d[0];
            }
        }
    }

    enum Kind {
        ROUND, SQUARE;

        boolean isRound() {
            return this == ROUND;
        }
    }
}
"#;

    fn by_name<'a>(members: &'a [Member], name: &str) -> &'a Member {
        members
            .iter()
            .find(|member| member.signature.starts_with(name))
            .unwrap_or_else(|| panic!("no member {name}"))
    }

    #[test]
    fn extracts_members_of_nested_types() {
        let members = members(SHAPES).unwrap();
        let signatures: Vec<(&str, &str)> = members
            .iter()
            .map(|member| (member.type_name.as_str(), member.signature.as_str()))
            .collect();
        assert_eq!(
            signatures,
            vec![
                ("geo.Shapes", "Shapes(int)"),
                ("geo.Shapes", "total(List,int[])"),
                ("geo.Shapes$Circle", "radius(double[],String[])"),
                ("geo.Shapes$Kind", "isRound()"),
            ]
        );

        let constructor = by_name(&members, "Shapes(");
        assert!(constructor.is_constructor());
        assert_eq!((constructor.start_line, constructor.end_line), (8, 10));
    }

    #[test]
    fn statement_lines_cover_blocks_and_unbraced_bodies() {
        let members = members(SHAPES).unwrap();
        let total = by_name(&members, "total");
        assert_eq!(total.name, "total");
        assert_eq!((total.start_line, total.end_line), (12, 21));
        assert_eq!(
            total.statement_lines,
            BTreeSet::from([13, 14, 15, 16, 17, 19, 20])
        );

        let radius = by_name(&members, "radius");
        assert_eq!(radius.statement_lines, BTreeSet::from([25, 27, 29]));
    }

    #[test]
    fn lambda_and_switch_rule_bodies_count_as_statements() {
        let source = r#"class Rules {
    int pick(int k) {
        Runnable r = () -> {
            System.out.println(k);
        };
        return switch (k) {
            case 1 -> 10;
            default -> {
                yield 20;
            }
        };
    }
}
"#;
        let members = members(source).unwrap();
        assert_eq!(members[0].type_name, "Rules");
        assert_eq!(
            members[0].statement_lines,
            BTreeSet::from([3, 4, 6, 7, 9])
        );
    }

    #[test]
    fn encloses_is_strict() {
        let member = Member {
            name: "run".into(),
            signature: "run()".into(),
            type_name: "A".into(),
            start_line: 3,
            end_line: 6,
            statement_lines: BTreeSet::new(),
        };
        assert!(!member.encloses(3));
        assert!(member.encloses(4));
        assert!(!member.encloses(6));
    }

    #[test]
    fn erases_generics_and_whitespace() {
        assert_eq!(erase_type("Map<String, List<Integer>>"), "Map");
        assert_eq!(erase_type("java.util.List<? extends T> []"), "java.util.List[]");
        assert_eq!(erase_type("int"), "int");
    }

    #[test]
    fn abstract_methods_have_no_statements() {
        let source = "package p;\ninterface Op {\n    int apply(int x);\n}\n";
        let members = members(source).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].type_name, "p.Op");
        assert!(members[0].statement_lines.is_empty());
    }

    #[test]
    fn type_names_follow_the_package_declaration() {
        let type_names = |source: &str| -> Vec<String> {
            members(source)
                .unwrap()
                .into_iter()
                .map(|member| member.type_name)
                .collect()
        };

        assert_eq!(
            type_names("package org.calc.core;\nclass A {\n    void a() {}\n}\n"),
            vec!["org.calc.core.A".to_string()]
        );
        assert_eq!(
            type_names("package org . calc\n    .core;\nclass A {\n    void a() {}\n}\n"),
            vec!["org.calc.core.A".to_string()]
        );
        assert_eq!(
            type_names("class Bare {\n    void b() {}\n}\n"),
            vec!["Bare".to_string()]
        );
    }
}
