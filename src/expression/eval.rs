//! The expression interpreter.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::time::Duration;

use futures::future::BoxFuture;
use http::header::HeaderName;
use http::header::HeaderValue;
use http::HeaderMap;

use super::Dict;
use super::Dynamic;
use super::Expression;
use super::GraphQLCall;
use super::Logical;
use super::Math;
use super::Opt;
use super::Unsafe;
use crate::endpoint::Method;
use crate::error::ResolverError;
use crate::graphql;
use crate::http::UpstreamRequest;
use crate::loader::DataLoader;
use crate::value::DynamicValue;
use crate::value::Object;
use crate::BindingId;

/// The lexical binding table threaded through one evaluation.
#[derive(Debug, Default)]
pub struct Scope {
    bindings: Vec<(BindingId, DynamicValue)>,
}

impl Scope {
    fn push(&mut self, id: BindingId, value: DynamicValue) {
        self.bindings.push((id, value));
    }

    fn pop(&mut self, id: BindingId) {
        if let Some(index) = self.bindings.iter().rposition(|(bound, _)| *bound == id) {
            self.bindings.remove(index);
        }
    }

    fn lookup(&self, id: BindingId) -> Option<&DynamicValue> {
        self.bindings
            .iter()
            .rev()
            .find(|(bound, _)| *bound == id)
            .map(|(_, value)| value)
    }
}

/// Interprets expressions for one field resolution.
pub struct Evaluator<'a> {
    loader: &'a DataLoader,
    cache: Option<&'a ResolverCache>,
    /// The rendered sub-selection of the current field, forwarded to
    /// upstream GraphQL operations.
    selection: Option<String>,
    /// Allow-listed inbound headers, attached to every upstream call.
    forward_headers: HeaderMap,
}

impl<'a> Evaluator<'a> {
    pub fn new(loader: &'a DataLoader) -> Self {
        Evaluator {
            loader,
            cache: None,
            selection: None,
            forward_headers: HeaderMap::new(),
        }
    }

    pub fn with_forward_headers(mut self, headers: HeaderMap) -> Self {
        self.forward_headers = headers;
        self
    }

    pub fn with_cache(mut self, cache: &'a ResolverCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_selection(mut self, selection: Option<String>) -> Self {
        self.selection = selection;
        self
    }

    /// The single entry point: evaluates `expr` against `input` with a
    /// fresh scope.
    #[tracing::instrument(skip_all, fields(expr = expr.kind()))]
    pub async fn evaluate(
        &self,
        expr: &Expression,
        input: DynamicValue,
    ) -> Result<DynamicValue, ResolverError> {
        let mut scope = Scope::default();
        self.eval(expr, input, &mut scope).await
    }

    fn eval<'e>(
        &'e self,
        expr: &'e Expression,
        input: DynamicValue,
        scope: &'e mut Scope,
    ) -> BoxFuture<'e, Result<DynamicValue, ResolverError>> {
        Box::pin(async move {
            match expr {
                Expression::Literal { value, schema } => {
                    let rendered = crate::template::Template::render_literal(value, &input);
                    if let Some(schema) = schema {
                        schema.validate(&rendered).map_err(|failures| {
                            ResolverError::evaluation(format!(
                                "literal does not match its schema: {}",
                                failures.join("; ")
                            ))
                        })?;
                    }
                    Ok(rendered)
                }
                Expression::Identity => Ok(input),
                Expression::Pipe(a, b) => {
                    let mid = self.eval(a, input, &mut *scope).await?;
                    self.eval(b, mid, scope).await
                }
                Expression::FunctionDef(id, body) => {
                    scope.push(*id, input.clone());
                    let result = self.eval(body, input, &mut *scope).await;
                    // The binding leaves scope on failure too.
                    scope.pop(*id);
                    result
                }
                Expression::Lookup(id) => scope.lookup(*id).cloned().ok_or_else(|| {
                    ResolverError::evaluation(format!("binding {id} is not in scope"))
                }),
                Expression::EqualTo(l, r) => {
                    let left = self.eval(l, input.clone(), &mut *scope).await?;
                    let right = self.eval(r, input, scope).await?;
                    Ok(DynamicValue::Bool(left == right))
                }
                Expression::Math(op) => self.eval_math(op, input, scope).await,
                Expression::Logical(op) => self.eval_logical(op, input, scope).await,
                Expression::Opt(op) => self.eval_opt(op, input, scope).await,
                Expression::Dict(op) => self.eval_dict(op, input, scope).await,
                Expression::Dynamic(op) => Ok(match op {
                    Dynamic::ToTyped(schema) | Dynamic::ToDynamic(schema) => {
                        if schema.validate(&input).is_ok() {
                            input
                        } else {
                            DynamicValue::Null
                        }
                    }
                    Dynamic::Path(path) => input.get_path(path).cloned().unwrap_or_default(),
                    Dynamic::Transform(transform) => transform.apply(&input),
                }),
                Expression::Unsafe(op) => self.eval_unsafe(op, input).await,
                Expression::Cache {
                    tag,
                    max_age,
                    inner,
                } => {
                    let key = (*tag, hash_input(&input));
                    if let Some(cached) = self.cache.and_then(|cache| cache.get(&key)) {
                        return Ok(cached);
                    }
                    let value = self.eval(inner, input, scope).await?;
                    if let Some(cache) = self.cache {
                        cache.insert(key, value.clone(), Duration::from_secs(*max_age));
                    }
                    Ok(value)
                }
            }
        })
    }

    async fn eval_math<'e>(
        &'e self,
        op: &'e Math,
        input: DynamicValue,
        scope: &'e mut Scope,
    ) -> Result<DynamicValue, ResolverError> {
        if let Math::Neg(operand) = op {
            return match self.eval(operand, input, scope).await? {
                DynamicValue::Int(i) => i
                    .checked_neg()
                    .map(DynamicValue::Int)
                    .ok_or_else(|| ResolverError::evaluation("integer overflow in neg")),
                DynamicValue::Float(f) => Ok(DynamicValue::Float(-f)),
                other => Err(non_numeric("neg", &other)),
            };
        }

        let (name, l, r) = match op {
            Math::Add(l, r) => ("add", l, r),
            Math::Sub(l, r) => ("sub", l, r),
            Math::Mul(l, r) => ("mul", l, r),
            Math::Div(l, r) => ("div", l, r),
            Math::Mod(l, r) => ("mod", l, r),
            Math::Gt(l, r) => ("gt", l, r),
            Math::Gte(l, r) => ("gte", l, r),
            Math::Neg(_) => unreachable!("handled above"),
        };
        let left = self.eval(l, input.clone(), &mut *scope).await?;
        let right = self.eval(r, input, scope).await?;

        match (left, right) {
            (DynamicValue::Int(a), DynamicValue::Int(b)) => {
                let checked = match name {
                    "add" => a.checked_add(b),
                    "sub" => a.checked_sub(b),
                    "mul" => a.checked_mul(b),
                    "div" => {
                        if b == 0 {
                            return Err(ResolverError::evaluation("division by zero"));
                        }
                        a.checked_div(b)
                    }
                    "mod" => {
                        if b == 0 {
                            return Err(ResolverError::evaluation("modulo by zero"));
                        }
                        a.checked_rem(b)
                    }
                    "gt" => return Ok(DynamicValue::Bool(a > b)),
                    "gte" => return Ok(DynamicValue::Bool(a >= b)),
                    _ => unreachable!(),
                };
                checked.map(DynamicValue::Int).ok_or_else(|| {
                    ResolverError::evaluation(format!("integer overflow in {name}"))
                })
            }
            (left, right) => {
                let (a, b) = match (left.as_f64(), right.as_f64()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return Err(ResolverError::evaluation(format!(
                        "{name} expects numeric operands"
                    ))),
                };
                match name {
                    "gt" => return Ok(DynamicValue::Bool(a > b)),
                    "gte" => return Ok(DynamicValue::Bool(a >= b)),
                    "div" | "mod" if b == 0.0 => {
                        return Err(ResolverError::evaluation("division by zero"))
                    }
                    _ => {}
                }
                Ok(DynamicValue::Float(match name {
                    "add" => a + b,
                    "sub" => a - b,
                    "mul" => a * b,
                    "div" => a / b,
                    "mod" => a % b,
                    _ => unreachable!(),
                }))
            }
        }
    }

    async fn eval_logical<'e>(
        &'e self,
        op: &'e Logical,
        input: DynamicValue,
        scope: &'e mut Scope,
    ) -> Result<DynamicValue, ResolverError> {
        match op {
            Logical::And(l, r) => {
                if !self.eval_bool(l, input.clone(), &mut *scope).await? {
                    return Ok(DynamicValue::Bool(false));
                }
                Ok(DynamicValue::Bool(self.eval_bool(r, input, scope).await?))
            }
            Logical::Or(l, r) => {
                if self.eval_bool(l, input.clone(), &mut *scope).await? {
                    return Ok(DynamicValue::Bool(true));
                }
                Ok(DynamicValue::Bool(self.eval_bool(r, input, scope).await?))
            }
            Logical::Not(operand) => Ok(DynamicValue::Bool(
                !self.eval_bool(operand, input, scope).await?,
            )),
            Logical::Cond {
                when,
                then,
                otherwise,
            } => {
                if self.eval_bool(when, input.clone(), &mut *scope).await? {
                    self.eval(then, input, scope).await
                } else {
                    self.eval(otherwise, input, scope).await
                }
            }
        }
    }

    async fn eval_bool<'e>(
        &'e self,
        expr: &'e Expression,
        input: DynamicValue,
        scope: &'e mut Scope,
    ) -> Result<bool, ResolverError> {
        match self.eval(expr, input, scope).await? {
            DynamicValue::Bool(b) => Ok(b),
            other => Err(ResolverError::evaluation(format!(
                "logical operand must be a boolean, got {other:?}"
            ))),
        }
    }

    async fn eval_opt<'e>(
        &'e self,
        op: &'e Opt,
        input: DynamicValue,
        scope: &'e mut Scope,
    ) -> Result<DynamicValue, ResolverError> {
        match op {
            Opt::IsSome => Ok(DynamicValue::Bool(!input.is_null())),
            Opt::IsNone => Ok(DynamicValue::Bool(input.is_null())),
            Opt::Fold { none, some } => {
                if input.is_null() {
                    self.eval(none, DynamicValue::Null, scope).await
                } else {
                    self.eval(some, input, scope).await
                }
            }
            Opt::Apply(inner) => match inner {
                Some(expr) => self.eval(expr, input, scope).await,
                None => Ok(DynamicValue::Null),
            },
            Opt::Wrap => Ok(input),
        }
    }

    async fn eval_dict<'e>(
        &'e self,
        op: &'e Dict,
        input: DynamicValue,
        scope: &'e mut Scope,
    ) -> Result<DynamicValue, ResolverError> {
        match op {
            Dict::Get(key) => {
                let key = self.eval_key(key, input.clone(), scope).await?;
                let map = expect_object(&input, "get")?;
                Ok(map.get(&key).cloned().unwrap_or_default())
            }
            Dict::Put(key, value) => {
                let key = self.eval_key(key, input.clone(), &mut *scope).await?;
                let value = self.eval(value, input.clone(), scope).await?;
                let mut map = expect_object(&input, "put")?.clone();
                map.insert(key, value);
                Ok(DynamicValue::Object(map))
            }
            Dict::ToPair => {
                let map = expect_object(&input, "toPair")?;
                Ok(DynamicValue::List(
                    map.iter()
                        .map(|(k, v)| {
                            DynamicValue::List(vec![DynamicValue::from(k.as_str()), v.clone()])
                        })
                        .collect(),
                ))
            }
        }
    }

    async fn eval_key<'e>(
        &'e self,
        expr: &'e Expression,
        input: DynamicValue,
        scope: &'e mut Scope,
    ) -> Result<String, ResolverError> {
        match self.eval(expr, input, scope).await? {
            DynamicValue::String(s) => Ok(s),
            other => Err(ResolverError::evaluation(format!(
                "mapping key must be a string, got {other:?}"
            ))),
        }
    }

    async fn eval_unsafe(
        &self,
        op: &Unsafe,
        input: DynamicValue,
    ) -> Result<DynamicValue, ResolverError> {
        match op {
            Unsafe::Http { endpoint, batching } => {
                let mut request = endpoint.evaluate(&input)?;
                for (name, value) in &self.forward_headers {
                    request.headers.entry(name).or_insert_with(|| value.clone());
                }
                let response = match batching {
                    Some(batching) => self.loader.load_batched(request, batching).await?,
                    None => self.loader.load(request).await?,
                };
                Ok(response.body)
            }
            Unsafe::GraphQL(call) => self.eval_graphql(call, input).await,
            Unsafe::Debug(prefix) => {
                tracing::debug!(prefix = prefix.as_str(), value = ?input, "debug expression");
                Ok(input)
            }
            Unsafe::Die(message) => Err(ResolverError::evaluation(message.clone())),
        }
    }

    async fn eval_graphql(
        &self,
        call: &GraphQLCall,
        input: DynamicValue,
    ) -> Result<DynamicValue, ResolverError> {
        let mut rendered_args = Vec::with_capacity(call.args.len());
        for (name, template) in &call.args {
            let value = template.resolve_typed(&input);
            if !value.is_null() {
                rendered_args.push(format!("{name}: {}", graphql_literal(&value)));
            }
        }
        let arguments = if rendered_args.is_empty() {
            String::new()
        } else {
            format!("({})", rendered_args.join(", "))
        };
        let selection = self.selection.as_deref().unwrap_or_default();
        let operation = graphql::Request::builder()
            .query(format!("query {{ {}{}{} }}", call.field, arguments, selection))
            .build();

        let mut headers = HeaderMap::new();
        for (name, template) in &call.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ResolverError::evaluation(format!("invalid header name '{name}': {e}"))
            })?;
            let value =
                HeaderValue::from_str(&template.resolve(&input)).map_err(|e| {
                    ResolverError::evaluation(format!("invalid header value: {e}"))
                })?;
            headers.insert(name, value);
        }
        for (name, value) in &self.forward_headers {
            headers.entry(name).or_insert_with(|| value.clone());
        }

        let response = if call.batch {
            self.loader
                .load_graphql(call.url.clone(), headers, operation)
                .await?
        } else {
            let body = serde_json::to_vec(&operation).map_err(|e| {
                ResolverError::evaluation(format!("operation failed to serialize: {e}"))
            })?;
            headers.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
            let request = UpstreamRequest {
                method: Method::Post,
                url: call.url.clone(),
                headers,
                body: body.into(),
            };
            let upstream = self.loader.load(request).await?;
            let json = serde_json::Value::from(upstream.body);
            serde_json::from_value(json).map_err(|e| ResolverError::MalformedResponse {
                reason: format!("not a GraphQL response: {e}"),
            })?
        };

        if let Some(error) = response.errors.first() {
            return Err(ResolverError::UpstreamGraphQL {
                reason: error.message.clone(),
            });
        }
        let data = DynamicValue::from(response.data.unwrap_or_default());
        Ok(data.get(&call.field).cloned().unwrap_or_default())
    }
}

fn expect_object<'v>(
    input: &'v DynamicValue,
    op: &str,
) -> Result<&'v Object, ResolverError> {
    input.as_object().ok_or_else(|| {
        ResolverError::evaluation(format!("{op} expects a mapping input, got {input:?}"))
    })
}

fn non_numeric(op: &str, value: &DynamicValue) -> ResolverError {
    ResolverError::evaluation(format!("{op} expects a numeric operand, got {value:?}"))
}

/// Renders a value as a GraphQL literal for upstream operations.
fn graphql_literal(value: &DynamicValue) -> String {
    match value {
        DynamicValue::Null => "null".to_string(),
        DynamicValue::Bool(b) => b.to_string(),
        DynamicValue::Int(i) => i.to_string(),
        DynamicValue::Float(f) => f.to_string(),
        DynamicValue::String(s) => serde_json::Value::String(s.clone()).to_string(),
        DynamicValue::Binary(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()).to_string()
        }
        DynamicValue::Enum { name, .. } => name.clone(),
        DynamicValue::List(items) => format!(
            "[{}]",
            items
                .iter()
                .map(graphql_literal)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        DynamicValue::Object(map) => format!(
            "{{{}}}",
            map.iter()
                .map(|(k, v)| format!("{k}: {}", graphql_literal(v)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

fn hash_input(input: &DynamicValue) -> u64 {
    let mut hasher = DefaultHasher::new();
    input
        .to_json_vec()
        .unwrap_or_default()
        .hash(&mut hasher);
    hasher.finish()
}

/// A process-wide memo for `@cache`-annotated resolvers: entries carry
/// their own time-to-live.
pub struct ResolverCache {
    entries: moka::sync::Cache<(u64, u64), CachedValue>,
}

#[derive(Clone)]
struct CachedValue {
    value: DynamicValue,
    ttl: Duration,
}

struct PerEntryExpiry;

impl moka::Expiry<(u64, u64), CachedValue> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &(u64, u64),
        value: &CachedValue,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

impl ResolverCache {
    pub fn new(capacity: u64) -> Self {
        ResolverCache {
            entries: moka::sync::Cache::builder()
                .max_capacity(capacity)
                .expire_after(PerEntryExpiry)
                .build(),
        }
    }

    fn get(&self, key: &(u64, u64)) -> Option<DynamicValue> {
        self.entries.get(key).map(|entry| entry.value)
    }

    fn insert(&self, key: (u64, u64), value: DynamicValue, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.entries.insert(key, CachedValue { value, ttl });
    }
}

impl Default for ResolverCache {
    fn default() -> Self {
        ResolverCache::new(10_000)
    }
}
