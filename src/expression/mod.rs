//! The resolver intermediate representation.
//!
//! Every field resolver compiles to an [`Expression`]: a tagged union
//! interpreted by [`Evaluator`](eval::Evaluator). Expressions are plain
//! values; they serialize with the blueprint and therefore participate in
//! its digest.

mod context;
mod eval;

use serde::Deserialize;
use serde::Serialize;

use crate::blueprint::Batching;
use crate::endpoint::Endpoint;
use crate::template::Template;
use crate::value::DynamicValue;
use crate::value::TSchema;

pub use context::Context;
pub use eval::Evaluator;
pub use eval::ResolverCache;
pub use eval::Scope;

/// Identifies one lexical binding. Fresh ids are issued by
/// [`BindingAllocator`] whenever compilation introduces a function.
pub type BindingId = u64;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Expression {
    /// A literal value, optionally checked against a structural schema.
    /// String leaves may contain template parameters; they render against
    /// the input before the check.
    Literal {
        value: DynamicValue,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        schema: Option<TSchema>,
    },
    /// Yields the current input.
    Identity,
    /// `b(a(input))`; `a` is fully awaited before `b` begins.
    Pipe(Box<Expression>, Box<Expression>),
    /// Evaluates the body with the input bound under the given id.
    FunctionDef(BindingId, Box<Expression>),
    /// Yields the value bound under the given id; a missing binding is an
    /// evaluation error.
    Lookup(BindingId),
    /// Structural equality of both operands.
    EqualTo(Box<Expression>, Box<Expression>),
    Math(Math),
    Logical(Logical),
    Opt(Opt),
    Dict(Dict),
    Dynamic(Dynamic),
    Unsafe(Unsafe),
    /// Memoizes the inner resolver's value for `max_age` seconds.
    Cache {
        tag: u64,
        max_age: u64,
        inner: Box<Expression>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Math {
    Add(Box<Expression>, Box<Expression>),
    Sub(Box<Expression>, Box<Expression>),
    Mul(Box<Expression>, Box<Expression>),
    Div(Box<Expression>, Box<Expression>),
    Mod(Box<Expression>, Box<Expression>),
    Gt(Box<Expression>, Box<Expression>),
    Gte(Box<Expression>, Box<Expression>),
    Neg(Box<Expression>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Logical {
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    Cond {
        when: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
}

/// Option-shaped operations. The dynamic domain encodes `None` as `Null`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Opt {
    IsSome,
    IsNone,
    /// `none` evaluates when the input is null, `some` otherwise.
    Fold {
        none: Box<Expression>,
        some: Box<Expression>,
    },
    /// Constructs an optional: evaluates the inner expression when
    /// present, yields null otherwise.
    Apply(Option<Box<Expression>>),
    /// Wraps the input; with null-encoded options this is the identity.
    Wrap,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Dict {
    /// Looks the evaluated key up in the input mapping; missing keys yield
    /// null.
    Get(Box<Expression>),
    /// Returns the input mapping with the evaluated key/value inserted.
    Put(Box<Expression>, Box<Expression>),
    /// Converts the input mapping into a list of `[key, value]` pairs.
    ToPair,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Dynamic {
    /// The input when it matches the schema, null otherwise. Never an
    /// error.
    ToTyped(TSchema),
    /// The typed value reinterpreted as dynamic; checked the same way.
    ToDynamic(TSchema),
    /// Projects a sub-value; a missing path yields null, never an error.
    Path(Vec<String>),
    Transform(JsonTransform),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JsonTransform {
    Identity,
    Const(DynamicValue),
    Path(Vec<String>),
    Compose(Vec<JsonTransform>),
}

impl JsonTransform {
    pub fn apply(&self, value: &DynamicValue) -> DynamicValue {
        match self {
            JsonTransform::Identity => value.clone(),
            JsonTransform::Const(constant) => constant.clone(),
            JsonTransform::Path(path) => value.get_path(path).cloned().unwrap_or_default(),
            JsonTransform::Compose(transforms) => transforms
                .iter()
                .fold(value.clone(), |acc, t| t.apply(&acc)),
        }
    }
}

/// Operations with effects: upstream calls, logging, aborts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Unsafe {
    /// Evaluates the endpoint against the input and defers execution to
    /// the request's data loader.
    Http {
        endpoint: Endpoint,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        batching: Option<Batching>,
    },
    /// Renders an upstream GraphQL operation. `batch` coalesces sibling
    /// calls into one array-bodied POST distributed by position.
    GraphQL(GraphQLCall),
    /// Logs the input under the given prefix and passes it through.
    Debug(String),
    /// Fails evaluation with the given message.
    Die(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLCall {
    pub url: url::Url,
    /// Upstream field to query.
    pub field: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub args: Vec<(String, Template)>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub headers: Vec<(String, Template)>,
    #[serde(default)]
    pub batch: bool,
}

/// Issues fresh binding ids at compile time.
#[derive(Debug, Default)]
pub struct BindingAllocator(u64);

impl BindingAllocator {
    pub fn fresh(&mut self) -> BindingId {
        self.0 += 1;
        self.0
    }
}

impl Expression {
    pub fn literal(value: DynamicValue) -> Expression {
        Expression::Literal {
            value,
            schema: None,
        }
    }

    pub fn typed_literal(value: DynamicValue, schema: TSchema) -> Expression {
        Expression::Literal {
            value,
            schema: Some(schema),
        }
    }

    pub fn path<T: Into<String>>(parts: impl IntoIterator<Item = T>) -> Expression {
        Expression::Dynamic(Dynamic::Path(parts.into_iter().map(Into::into).collect()))
    }

    pub fn pipe(self, next: Expression) -> Expression {
        Expression::Pipe(Box::new(self), Box::new(next))
    }

    pub fn eq(self, other: Expression) -> Expression {
        Expression::EqualTo(Box::new(self), Box::new(other))
    }

    /// Short display name used in trace spans.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Expression::Literal { .. } => "Literal",
            Expression::Identity => "Identity",
            Expression::Pipe(..) => "Pipe",
            Expression::FunctionDef(..) => "FunctionDef",
            Expression::Lookup(..) => "Lookup",
            Expression::EqualTo(..) => "EqualTo",
            Expression::Math(..) => "Math",
            Expression::Logical(..) => "Logical",
            Expression::Opt(..) => "Opt",
            Expression::Dict(..) => "Dict",
            Expression::Dynamic(..) => "Dynamic",
            Expression::Unsafe(Unsafe::Http { .. }) => "Http",
            Expression::Unsafe(Unsafe::GraphQL(..)) => "GraphQL",
            Expression::Unsafe(..) => "Unsafe",
            Expression::Cache { .. } => "Cache",
        }
    }
}
