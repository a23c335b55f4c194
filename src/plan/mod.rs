//! The resolver step tree.
//!
//! [`generate`] walks a blueprint and produces, for every object type, a
//! step per field. The table is built in two passes (declare every type,
//! then wire fields) so recursive types resolve through their slot.

mod execute;

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::blueprint::ArgDef;
use crate::blueprint::Blueprint;
use crate::blueprint::FieldTypeRef;
use crate::expression::Expression;
use crate::value::DynamicValue;

pub use execute::ExecutionService;

/// How a field's resolved value turns into response output.
#[derive(Clone, Debug)]
pub(crate) enum Output {
    Scalar {
        non_null: bool,
    },
    /// Resolves through the plan's type table, which tolerates recursion.
    Object {
        type_name: String,
        non_null: bool,
    },
    /// Maps sequence values element-wise.
    List {
        inner: Box<Output>,
        non_null: bool,
    },
}

impl Output {
    fn of(type_ref: &FieldTypeRef, objects: &HashMap<String, ObjectStep>) -> Output {
        match type_ref {
            FieldTypeRef::Named(name) => {
                if objects.contains_key(name) {
                    Output::Object {
                        type_name: name.clone(),
                        non_null: false,
                    }
                } else {
                    Output::Scalar { non_null: false }
                }
            }
            FieldTypeRef::List(inner) => Output::List {
                inner: Box::new(Output::of(inner, objects)),
                non_null: false,
            },
            FieldTypeRef::NonNull(inner) => match Output::of(inner, objects) {
                Output::Scalar { .. } => Output::Scalar { non_null: true },
                Output::Object { type_name, .. } => Output::Object {
                    type_name,
                    non_null: true,
                },
                Output::List { inner, .. } => Output::List {
                    inner,
                    non_null: true,
                },
            },
        }
    }

    pub(crate) fn non_null(&self) -> bool {
        match self {
            Output::Scalar { non_null }
            | Output::Object { non_null, .. }
            | Output::List { non_null, .. } => *non_null,
        }
    }
}

/// How a field obtains its value.
#[derive(Clone, Debug)]
pub(crate) enum Step {
    /// An already-resolved value; constant resolvers collapse at plan
    /// construction.
    Pure(DynamicValue),
    /// No resolver declared: the field reads its name out of the parent
    /// value.
    Parent,
    /// A resolver expression evaluated by the runtime with a fresh
    /// [`Context`](crate::expression::Context) as input.
    Query(Arc<Expression>),
}

#[derive(Clone, Debug)]
pub(crate) struct FieldStep {
    pub(crate) step: Step,
    pub(crate) output: Output,
    pub(crate) args: Vec<ArgDef>,
    /// Projection applied to the resolved value before children see it.
    pub(crate) inline: Option<Vec<String>>,
    /// The resolver renders an upstream GraphQL operation and needs the
    /// field's sub-selection forwarded.
    pub(crate) forwards_selection: bool,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ObjectStep {
    pub(crate) name: String,
    pub(crate) fields: IndexMap<String, FieldStep>,
}

#[derive(Clone, Debug)]
pub(crate) struct Plan {
    pub(crate) objects: HashMap<String, ObjectStep>,
    pub(crate) query_root: String,
    pub(crate) mutation_root: Option<String>,
}

pub(crate) fn generate(blueprint: &Blueprint) -> Plan {
    // Pass one: a slot per type, so field wiring can classify references
    // (object vs. scalar) without ordering constraints.
    let mut objects: HashMap<String, ObjectStep> = blueprint
        .types
        .keys()
        .map(|name| {
            (
                name.clone(),
                ObjectStep {
                    name: name.clone(),
                    fields: IndexMap::new(),
                },
            )
        })
        .collect();

    // Pass two: wire the fields.
    for (type_name, type_def) in &blueprint.types {
        let mut fields = IndexMap::with_capacity(type_def.fields.len());
        for (field_name, field_def) in &type_def.fields {
            let step = match &field_def.resolver {
                None => Step::Parent,
                Some(Expression::Literal {
                    value,
                    schema: None,
                }) if literal_is_static(value) => Step::Pure(value.clone()),
                Some(expr) => Step::Query(Arc::new(expr.clone())),
            };
            let forwards_selection = field_def
                .resolver
                .as_ref()
                .map(uses_graphql)
                .unwrap_or(false);
            fields.insert(
                field_name.clone(),
                FieldStep {
                    step,
                    output: Output::of(&field_def.of_type, &objects),
                    args: field_def.args.clone(),
                    inline: field_def.inline.clone(),
                    forwards_selection,
                },
            );
        }
        if let Some(slot) = objects.get_mut(type_name) {
            slot.fields = fields;
        }
    }

    Plan {
        objects,
        query_root: blueprint.schema.query.clone(),
        mutation_root: blueprint.schema.mutation.clone(),
    }
}

/// A literal with no template parameters needs no evaluation at all.
fn literal_is_static(value: &DynamicValue) -> bool {
    match value {
        DynamicValue::String(s) => crate::template::Template::parse(s).is_literal(),
        DynamicValue::List(items) => items.iter().all(literal_is_static),
        DynamicValue::Object(map) => map.values().all(literal_is_static),
        _ => true,
    }
}

fn uses_graphql(expr: &Expression) -> bool {
    use crate::expression::Dict;
    use crate::expression::Logical;
    use crate::expression::Math;
    use crate::expression::Opt;
    use crate::expression::Unsafe;

    match expr {
        Expression::Unsafe(Unsafe::GraphQL(_)) => true,
        Expression::Unsafe(_)
        | Expression::Literal { .. }
        | Expression::Identity
        | Expression::Lookup(_)
        | Expression::Dynamic(_) => false,
        Expression::Pipe(a, b) | Expression::EqualTo(a, b) => uses_graphql(a) || uses_graphql(b),
        Expression::FunctionDef(_, body) => uses_graphql(body),
        Expression::Cache { inner, .. } => uses_graphql(inner),
        Expression::Math(math) => match math {
            Math::Add(a, b)
            | Math::Sub(a, b)
            | Math::Mul(a, b)
            | Math::Div(a, b)
            | Math::Mod(a, b)
            | Math::Gt(a, b)
            | Math::Gte(a, b) => uses_graphql(a) || uses_graphql(b),
            Math::Neg(a) => uses_graphql(a),
        },
        Expression::Logical(logical) => match logical {
            Logical::And(a, b) | Logical::Or(a, b) => uses_graphql(a) || uses_graphql(b),
            Logical::Not(a) => uses_graphql(a),
            Logical::Cond {
                when,
                then,
                otherwise,
            } => uses_graphql(when) || uses_graphql(then) || uses_graphql(otherwise),
        },
        Expression::Opt(opt) => match opt {
            Opt::Fold { none, some } => uses_graphql(none) || uses_graphql(some),
            Opt::Apply(Some(inner)) => uses_graphql(inner),
            _ => false,
        },
        Expression::Dict(dict) => match dict {
            Dict::Get(a) => uses_graphql(a),
            Dict::Put(a, b) => uses_graphql(a) || uses_graphql(b),
            Dict::ToPair => false,
        },
    }
}
