//! Mustache-style templates: literal text interleaved with `{{a.b.c}}`
//! parameters.
//!
//! Parsing is total: input that does not match the parameter grammar is
//! kept as literal text. Printing is the exact inverse of parsing, so a
//! parsed template re-encodes to the same string.

use std::fmt;

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::bytes::complete::take_until;
use nom::character::complete::alpha1;
use nom::character::complete::alphanumeric1;
use nom::character::complete::char;
use nom::character::complete::multispace0;
use nom::combinator::map;
use nom::multi::many0;
use nom::multi::separated_list1;
use nom::sequence::delimited;
use nom::sequence::tuple;
use nom::Finish;
use nom::IResult;

use crate::value::DynamicValue;

/// A parsed template.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Template(Vec<Segment>);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Segment {
    Text(String),
    Param(Vec<String>),
}

/// Where template parameters get their values from during substitution.
pub trait TemplateSource {
    fn param(&self, path: &[String]) -> Option<DynamicValue>;
}

impl TemplateSource for DynamicValue {
    fn param(&self, path: &[String]) -> Option<DynamicValue> {
        self.get_path(path).cloned()
    }
}

impl Template {
    pub fn parse(input: &str) -> Template {
        match template(input).finish() {
            Ok(("", segments)) => Template(segments),
            // Anything the grammar rejects is literal text.
            _ => Template(vec![Segment::Text(input.to_string())]),
        }
    }

    /// A template with no parameters.
    pub fn is_literal(&self) -> bool {
        self.0
            .iter()
            .all(|segment| matches!(segment, Segment::Text(_)))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn params(&self) -> impl Iterator<Item = &Vec<String>> {
        self.0.iter().filter_map(|segment| match segment {
            Segment::Param(path) => Some(path),
            Segment::Text(_) => None,
        })
    }

    /// Substitutes every parameter from `source`. A parameter the source
    /// cannot resolve re-emits literally, `{{a.b}}`, so the output shows
    /// what was missing.
    pub fn resolve(&self, source: &impl TemplateSource) -> String {
        self.0
            .iter()
            .map(|segment| match segment {
                Segment::Text(text) => text.clone(),
                Segment::Param(path) => source
                    .param(path)
                    .map(|value| value.to_path_string().into_owned())
                    .unwrap_or_else(|| Segment::Param(path.clone()).to_string()),
            })
            .collect()
    }

    /// Substitutes the parameter of a single-parameter template keeping its
    /// type; any other shape resolves like [`Template::resolve`].
    pub fn resolve_typed(&self, source: &impl TemplateSource) -> DynamicValue {
        match self.0.as_slice() {
            [Segment::Param(path)] => source
                .param(path)
                .unwrap_or_else(|| DynamicValue::String(self.to_string())),
            _ => DynamicValue::String(self.resolve(source)),
        }
    }

    /// Renders a literal value whose string leaves may contain templates:
    /// a leaf that is exactly one parameter keeps the resolved value's
    /// type, mixed leaves resolve to strings.
    pub fn render_literal(value: &DynamicValue, source: &impl TemplateSource) -> DynamicValue {
        match value {
            DynamicValue::String(s) => {
                let template = Template::parse(s);
                if template.is_literal() {
                    value.clone()
                } else {
                    template.resolve_typed(source)
                }
            }
            DynamicValue::List(items) => DynamicValue::List(
                items
                    .iter()
                    .map(|item| Template::render_literal(item, source))
                    .collect(),
            ),
            DynamicValue::Object(map) => DynamicValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Template::render_literal(v, source)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Text(text) => f.write_str(text),
            Segment::Param(path) => write!(f, "{{{{{}}}}}", path.join(".")),
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            segment.fmt(f)?;
        }
        Ok(())
    }
}

impl From<Vec<Segment>> for Template {
    fn from(segments: Vec<Segment>) -> Self {
        Template(segments)
    }
}

// Templates serialize as their textual form; parsing is total, so
// deserialization cannot fail.
impl serde::Serialize for Template {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Template {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
        Ok(Template::parse(&raw))
    }
}

fn identifier(input: &str) -> IResult<&str, String> {
    map(
        tuple((
            multispace0,
            alpha1,
            many0(alt((alphanumeric1, tag("_")))),
            multispace0,
        )),
        |(_, head, tail, _): (&str, &str, Vec<&str>, &str)| {
            let mut name = head.to_string();
            name.extend(tail);
            name
        },
    )(input)
}

fn param(input: &str) -> IResult<&str, Segment> {
    delimited(
        tag("{{"),
        map(separated_list1(char('.'), identifier), Segment::Param),
        tag("}}"),
    )(input)
}

fn text(input: &str) -> IResult<&str, Segment> {
    map(take_until("{{"), |t: &str| Segment::Text(t.to_string()))(input)
}

fn template(input: &str) -> IResult<&str, Vec<Segment>> {
    let (rest, mut segments) = many0(alt((param, text)))(input)?;
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    segments.retain(|segment| !matches!(segment, Segment::Text(t) if t.is_empty()));
    Ok(("", segments))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dynamic;

    fn path(parts: &[&str]) -> Segment {
        Segment::Param(parts.iter().map(|p| p.to_string()).collect())
    }

    #[test]
    fn parses_single_literal() {
        assert_eq!(
            Template::parse("hello/world"),
            Template(vec![Segment::Text("hello/world".to_string())])
        );
    }

    #[test]
    fn parses_single_param() {
        assert_eq!(
            Template::parse("{{hello.world}}"),
            Template(vec![path(&["hello", "world"])])
        );
    }

    #[test]
    fn parses_mixed_segments() {
        assert_eq!(
            Template::parse("http://localhost:8090/{{foo.bar}}/api/{{hello.world}}/end"),
            Template(vec![
                Segment::Text("http://localhost:8090/".to_string()),
                path(&["foo", "bar"]),
                Segment::Text("/api/".to_string()),
                path(&["hello", "world"]),
                Segment::Text("/end".to_string()),
            ])
        );
    }

    #[test]
    fn tolerates_spaces_inside_braces() {
        assert_eq!(
            Template::parse("{{ foo . bar }}"),
            Template(vec![path(&["foo", "bar"])])
        );
    }

    #[test]
    fn unterminated_braces_stay_literal() {
        assert_eq!(
            Template::parse("{{hello.world"),
            Template(vec![Segment::Text("{{hello.world".to_string())])
        );
    }

    #[test]
    fn print_is_the_inverse_of_parse() {
        for input in [
            "plain",
            "{{a}}",
            "{{a.b.c}}",
            "/users/{{value.id}}/posts?sort={{args.sort}}",
        ] {
            let template = Template::parse(input);
            assert_eq!(Template::parse(&template.to_string()), template);
            assert_eq!(template.to_string(), input);
        }
    }

    #[test]
    fn resolves_against_a_value() {
        let template = Template::parse("/v1/templates?project-id={{value.projectId}}");
        let ctx = dynamic!({"value": {"projectId": "123"}});
        assert_eq!(template.resolve(&ctx), "/v1/templates?project-id=123");
    }

    #[test]
    fn unresolved_params_reemit() {
        let template = Template::parse("prefix {{foo.bar}} suffix");
        assert_eq!(
            template.resolve(&DynamicValue::Null),
            "prefix {{foo.bar}} suffix"
        );
    }

    #[test]
    fn numbers_and_structures_stringify() {
        let template = Template::parse("{{a}}/{{b}}");
        let ctx = dynamic!({"a": 42, "b": {"k": true}});
        assert_eq!(template.resolve(&ctx), r#"42/{"k":true}"#);
    }

    #[test]
    fn typed_resolution_keeps_the_leaf_type() {
        let template = Template::parse("{{foo.bar}}");
        let ctx = dynamic!({"foo": {"bar": [1, 2]}});
        assert_eq!(template.resolve_typed(&ctx), dynamic!([1, 2]));
    }

    #[test]
    fn renders_literals_with_params() {
        let literal = dynamic!({"a": "{{foo.bar}}", "b": "id-{{foo.baz}}", "c": 7});
        let ctx = dynamic!({"foo": {"bar": {"nested": 1}, "baz": 9}});
        assert_eq!(
            Template::render_literal(&literal, &ctx),
            dynamic!({"a": {"nested": 1}, "b": "id-9", "c": 7})
        );
    }
}
