//! Query execution: walks a validated document against the step tree,
//! resolving sibling fields concurrently and reassembling them in
//! selection-set order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use apollo_compiler::ast;
use apollo_compiler::executable;
use apollo_compiler::validation::Valid;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use futures::future::join_all;
use futures::future::BoxFuture;
use http::HeaderMap;
use parking_lot::Mutex;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;

use super::generate;
use super::FieldStep;
use super::ObjectStep;
use super::Output;
use super::Plan;
use super::Step;
use crate::blueprint::compile;
use crate::blueprint::Blueprint;
use crate::config::Config;
use crate::error::CompileError;
use crate::error::ResolverError;
use crate::expression::Context;
use crate::expression::Evaluator;
use crate::expression::ResolverCache;
use crate::graphql;
use crate::http::HttpCache;
use crate::http::UpstreamClient;
use crate::json_ext::Path;
use crate::loader::DataLoader;
use crate::loader::LoaderSettings;
use crate::value::DynamicValue;
use crate::value::Object;

/// Serves GraphQL requests against one immutable blueprint.
pub struct ExecutionService {
    blueprint: Arc<Blueprint>,
    schema: Valid<Schema>,
    plan: Arc<Plan>,
    client: Arc<dyn UpstreamClient>,
    http_cache: Option<Arc<HttpCache>>,
    resolver_cache: Arc<ResolverCache>,
}

/// Marker for GraphQL's non-null propagation: the value at this position
/// had to become null, so the nearest nullable ancestor absorbs it.
struct Nullified;

struct RequestEnv<'a> {
    doc: &'a ExecutableDocument,
    variables: &'a graphql::Object,
    plan: &'a Plan,
    loader: DataLoader,
    resolver_cache: &'a ResolverCache,
    errors: Mutex<Vec<graphql::Error>>,
    forward_headers: HeaderMap,
}

impl RequestEnv<'_> {
    fn record(&self, error: graphql::Error) {
        self.errors.lock().push(error);
    }
}

impl ExecutionService {
    pub fn new(
        blueprint: Blueprint,
        client: Arc<dyn UpstreamClient>,
    ) -> Result<ExecutionService, CompileError> {
        blueprint.validate()?;
        let sdl = blueprint.to_sdl();
        let schema = Schema::parse_and_validate(sdl.as_str(), "blueprint.graphql")
            .map_err(|e| CompileError::InvalidSchema(e.errors.to_string()))?;
        let plan = Arc::new(generate(&blueprint));
        let http_cache = blueprint
            .upstream
            .http_cache
            .then(|| Arc::new(HttpCache::default()));
        Ok(ExecutionService {
            blueprint: Arc::new(blueprint),
            schema,
            plan,
            client,
            http_cache,
            resolver_cache: Arc::new(ResolverCache::default()),
        })
    }

    pub fn from_config(
        config: &Config,
        client: Arc<dyn UpstreamClient>,
    ) -> Result<ExecutionService, CompileError> {
        ExecutionService::new(compile(config)?, client)
    }

    pub fn blueprint(&self) -> &Blueprint {
        &self.blueprint
    }

    /// Executes one request. The server-level timeout, when configured,
    /// bounds the whole resolution tree; expiry cancels every outstanding
    /// upstream call and batch window along with the request's loader.
    #[tracing::instrument(skip_all, fields(operation = request.operation_name.as_deref()))]
    pub async fn execute(
        &self,
        request: graphql::Request,
        headers: &HeaderMap,
    ) -> graphql::Response {
        let doc = match self.parse_document(&request) {
            Ok(doc) => doc,
            Err(response) => return response,
        };
        let operation = match doc.operations.get(request.operation_name.as_deref()) {
            Ok(operation) => operation,
            Err(_) => {
                return graphql::Response::from_errors(vec![graphql::Error::builder()
                    .message(match &request.operation_name {
                        Some(name) => format!("operation '{name}' not found in the document"),
                        None => "the document must name which operation to run".to_string(),
                    })
                    .extension_code("OPERATION_NOT_FOUND")
                    .build()])
            }
        };

        let run = self.execute_operation(&doc, operation, &request.variables, headers);
        match self.blueprint.server.request_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, run).await {
                Ok(response) => response,
                Err(_) => graphql::Response::from_errors(vec![
                    ResolverError::Timeout.to_graphql_error(None)
                ]),
            },
            None => run.await,
        }
    }

    fn parse_document(
        &self,
        request: &graphql::Request,
    ) -> Result<ExecutableDocument, graphql::Response> {
        let reject = |code: &'static str, message: String| {
            graphql::Response::from_errors(vec![graphql::Error::builder()
                .message(message)
                .extension_code(code)
                .build()])
        };
        if self.blueprint.server.query_validation {
            ExecutableDocument::parse_and_validate(
                &self.schema,
                request.query.as_str(),
                "request.graphql",
            )
            .map(Valid::into_inner)
            .map_err(|e| reject("GRAPHQL_VALIDATION_FAILED", e.errors.to_string()))
        } else {
            ExecutableDocument::parse(&self.schema, request.query.as_str(), "request.graphql")
                .map_err(|e| reject("GRAPHQL_PARSE_FAILED", e.errors.to_string()))
        }
    }

    async fn execute_operation(
        &self,
        doc: &ExecutableDocument,
        operation: &executable::Operation,
        variables: &graphql::Object,
        headers: &HeaderMap,
    ) -> graphql::Response {
        let unsupported = |message: &str| {
            graphql::Response::from_errors(vec![graphql::Error::builder()
                .message(message.to_string())
                .extension_code("OPERATION_NOT_SUPPORTED")
                .build()])
        };
        let root_name = match operation.operation_type {
            ast::OperationType::Query => self.plan.query_root.clone(),
            ast::OperationType::Mutation => match &self.plan.mutation_root {
                Some(mutation) => mutation.clone(),
                None => return unsupported("the schema declares no mutation root"),
            },
            ast::OperationType::Subscription => {
                return unsupported("subscriptions are not supported")
            }
        };
        let root = self
            .plan
            .objects
            .get(&root_name)
            .expect("roots are checked at blueprint validation; qed");

        let allowed = &self.blueprint.upstream.allowed_headers;
        let mut ctx_headers = Object::default();
        let mut forward_headers = HeaderMap::new();
        for (name, value) in headers {
            if allowed.contains(name.as_str()) {
                let text = String::from_utf8_lossy(value.as_bytes()).into_owned();
                ctx_headers.insert(name.as_str().to_string(), DynamicValue::String(text));
                forward_headers.append(name, value.clone());
            }
        }

        let mut settings = LoaderSettings::new(
            Duration::from_millis(self.blueprint.upstream.batch_delay),
            self.blueprint.upstream.batch_max_size,
        );
        if let Some(cache) = &self.http_cache {
            settings = settings.with_http_cache(Arc::clone(cache));
        }

        let env = RequestEnv {
            doc,
            variables,
            plan: &self.plan,
            loader: DataLoader::new(Arc::clone(&self.client), settings),
            resolver_cache: &self.resolver_cache,
            errors: Mutex::new(Vec::new()),
            forward_headers,
        };
        let root_ctx = Context {
            value: DynamicValue::Null,
            args: Object::default(),
            parent: None,
            headers: ctx_headers,
            vars: self.blueprint.server.vars.clone(),
        };

        let data = match self
            .resolve_selection_set(&env, root, root_ctx, &operation.selection_set, Path::empty())
            .await
        {
            Ok(map) => Value::Object(map),
            Err(Nullified) => Value::Null,
        };
        graphql::Response {
            data: Some(data),
            errors: env.errors.into_inner(),
            extensions: Default::default(),
        }
    }

    /// Resolves one selection set against one object step. Sibling fields
    /// run concurrently; the response object is assembled in selection
    /// order afterwards.
    fn resolve_selection_set<'b>(
        &'b self,
        env: &'b RequestEnv<'b>,
        object: &'b ObjectStep,
        ctx: Context,
        selection_set: &'b executable::SelectionSet,
        path: Path,
    ) -> BoxFuture<'b, Result<JsonMap<ByteString, Value>, Nullified>> {
        Box::pin(async move {
            let mut fields = Vec::new();
            let mut seen = HashSet::new();
            collect_fields(env.doc, object, selection_set, &mut fields, &mut seen);

            let ctx = &ctx;
            let path = &path;
            let resolved = join_all(fields.into_iter().map(|field| async move {
                let key = field.response_key().as_str();
                if field.name.as_str() == "__typename" {
                    return (key, false, Ok(Value::String(object.name.clone().into())));
                }
                let Some(field_step) = object.fields.get(field.name.as_str()) else {
                    // Only reachable with query validation disabled.
                    env.record(
                        graphql::Error::builder()
                            .message(format!(
                                "field '{}' does not exist on type '{}'",
                                field.name, object.name
                            ))
                            .path(path.key(key))
                            .extension_code("GRAPHQL_VALIDATION_FAILED")
                            .build(),
                    );
                    return (key, false, Ok(Value::Null));
                };

                let field_path = path.key(key);
                let args = coerce_arguments(field_step, field, env.variables);
                let non_null = field_step.output.non_null();
                match self.resolve_step(env, field_step, ctx, field, &args).await {
                    Ok(mut value) => {
                        if let Some(inline) = &field_step.inline {
                            value = value.get_path(inline).cloned().unwrap_or_default();
                        }
                        let completed = self
                            .complete_value(
                                env,
                                &field_step.output,
                                value,
                                ctx,
                                &args,
                                &field.selection_set,
                                field_path,
                            )
                            .await;
                        (key, non_null, completed)
                    }
                    Err(error) => {
                        env.record(error.to_graphql_error(Some(field_path)));
                        if non_null {
                            (key, true, Err(Nullified))
                        } else {
                            (key, false, Ok(Value::Null))
                        }
                    }
                }
            }))
            .await;

            let mut map = JsonMap::with_capacity(resolved.len());
            for (key, non_null, result) in resolved {
                match result {
                    Ok(value) => {
                        map.insert(ByteString::from(key.to_string()), value);
                    }
                    Err(Nullified) if non_null => return Err(Nullified),
                    Err(Nullified) => {
                        map.insert(ByteString::from(key.to_string()), Value::Null);
                    }
                }
            }
            Ok(map)
        })
    }

    async fn resolve_step(
        &self,
        env: &RequestEnv<'_>,
        field_step: &FieldStep,
        ctx: &Context,
        field: &Node<executable::Field>,
        args: &Object,
    ) -> Result<DynamicValue, ResolverError> {
        match &field_step.step {
            Step::Pure(value) => Ok(value.clone()),
            Step::Parent => Ok(ctx
                .value
                .get(field.name.as_str())
                .cloned()
                .unwrap_or_default()),
            Step::Query(expr) => {
                let resolver_ctx = Context {
                    value: ctx.value.clone(),
                    args: args.clone(),
                    parent: ctx.parent.clone(),
                    headers: ctx.headers.clone(),
                    vars: ctx.vars.clone(),
                };
                let selection = field_step
                    .forwards_selection
                    .then(|| render_selection(env.doc, &field.selection_set))
                    .flatten();
                Evaluator::new(&env.loader)
                    .with_cache(env.resolver_cache)
                    .with_selection(selection)
                    .with_forward_headers(env.forward_headers.clone())
                    .evaluate(expr, resolver_ctx.to_value())
                    .await
            }
        }
    }

    /// Shapes a resolved value against the field's declared output type,
    /// recursing into objects and lists. Returns `Err` only when a
    /// non-null position had to become null.
    #[allow(clippy::too_many_arguments)]
    fn complete_value<'b>(
        &'b self,
        env: &'b RequestEnv<'b>,
        output: &'b Output,
        value: DynamicValue,
        ctx: &'b Context,
        args: &'b Object,
        selection_set: &'b executable::SelectionSet,
        path: Path,
    ) -> BoxFuture<'b, Result<Value, Nullified>> {
        Box::pin(async move {
            if value.is_null() {
                return if output.non_null() {
                    env.record(
                        graphql::Error::builder()
                            .message("value of a non-nullable field was null")
                            .path(path)
                            .extension_code("NULL_FOR_NON_NULL")
                            .build(),
                    );
                    Err(Nullified)
                } else {
                    Ok(Value::Null)
                };
            }
            match output {
                Output::Scalar { .. } => Ok(Value::from(value)),
                Output::Object { type_name, .. } => {
                    let object = env
                        .plan
                        .objects
                        .get(type_name)
                        .expect("object outputs are wired from the type table; qed");
                    let child_ctx = ctx.child(value, args.clone());
                    let map = self
                        .resolve_selection_set(env, object, child_ctx, selection_set, path)
                        .await?;
                    Ok(Value::Object(map))
                }
                Output::List { inner, non_null } => {
                    let items = match value {
                        DynamicValue::List(items) => items,
                        other => {
                            env.record(
                                graphql::Error::builder()
                                    .message(format!(
                                        "expected a list, the resolver produced {}",
                                        other.to_path_string()
                                    ))
                                    .path(path.clone())
                                    .extension_code("RESPONSE_DECODING_FAILED")
                                    .build(),
                            );
                            return if *non_null { Err(Nullified) } else { Ok(Value::Null) };
                        }
                    };
                    let path = &path;
                    let completed = join_all(items.into_iter().enumerate().map(
                        |(index, item)| async move {
                            self.complete_value(
                                env,
                                inner,
                                item,
                                ctx,
                                args,
                                selection_set,
                                path.index(index),
                            )
                            .await
                        },
                    ))
                    .await;
                    let mut values = Vec::with_capacity(completed.len());
                    for result in completed {
                        match result {
                            Ok(value) => values.push(value),
                            // A failed element nullifies the whole list.
                            Err(Nullified) => {
                                return if *non_null { Err(Nullified) } else { Ok(Value::Null) }
                            }
                        }
                    }
                    Ok(Value::Array(values))
                }
            }
        })
    }
}

/// Flattens the selection set into fields, resolving fragment spreads and
/// inline fragments whose type condition matches. Duplicate response keys
/// keep their first occurrence.
fn collect_fields<'doc>(
    doc: &'doc ExecutableDocument,
    object: &ObjectStep,
    selection_set: &'doc executable::SelectionSet,
    out: &mut Vec<&'doc Node<executable::Field>>,
    seen: &mut HashSet<&'doc str>,
) {
    for selection in &selection_set.selections {
        match selection {
            executable::Selection::Field(field) => {
                if seen.insert(field.response_key().as_str()) {
                    out.push(field);
                }
            }
            executable::Selection::FragmentSpread(spread) => {
                if let Some(fragment) = doc.fragments.get(&spread.fragment_name) {
                    if fragment.type_condition().as_str() == object.name {
                        collect_fields(doc, object, &fragment.selection_set, out, seen);
                    }
                }
            }
            executable::Selection::InlineFragment(inline) => {
                let matches = inline
                    .type_condition
                    .as_ref()
                    .map(|condition| condition.as_str() == object.name)
                    .unwrap_or(true);
                if matches {
                    collect_fields(doc, object, &inline.selection_set, out, seen);
                }
            }
        }
    }
}

fn coerce_arguments(
    field_step: &FieldStep,
    field: &Node<executable::Field>,
    variables: &graphql::Object,
) -> Object {
    let mut args = Object::with_capacity(field_step.args.len());
    for arg_def in &field_step.args {
        let supplied = field
            .arguments
            .iter()
            .find(|argument| argument.name.as_str() == arg_def.name)
            .map(|argument| coerce_value(&argument.value, variables));
        match supplied {
            Some(value) if !value.is_null() => {
                args.insert(arg_def.name.clone(), value);
            }
            _ => {
                if let Some(default) = &arg_def.default {
                    args.insert(arg_def.name.clone(), default.clone());
                }
            }
        }
    }
    args
}

fn coerce_value(value: &ast::Value, variables: &graphql::Object) -> DynamicValue {
    match value {
        ast::Value::Null => DynamicValue::Null,
        ast::Value::Boolean(b) => DynamicValue::Bool(*b),
        ast::Value::Enum(name) => DynamicValue::Enum {
            name: name.as_str().to_string(),
            value: Box::new(DynamicValue::Null),
        },
        ast::Value::Variable(name) => variables
            .get(name.as_str())
            .cloned()
            .map(DynamicValue::from)
            .unwrap_or_default(),
        ast::Value::String(s) => DynamicValue::String(s.as_str().to_string()),
        ast::Value::Int(i) => i
            .try_to_i32()
            .map(|v| DynamicValue::Int(v as i64))
            .or_else(|_| i.try_to_f64().map(DynamicValue::Float))
            .unwrap_or_default(),
        ast::Value::Float(f) => f.try_to_f64().map(DynamicValue::Float).unwrap_or_default(),
        ast::Value::List(items) => DynamicValue::List(
            items
                .iter()
                .map(|item| coerce_value(item, variables))
                .collect(),
        ),
        ast::Value::Object(fields) => DynamicValue::Object(
            fields
                .iter()
                .map(|(name, item)| (name.as_str().to_string(), coerce_value(item, variables)))
                .collect(),
        ),
    }
}

/// Renders a field's sub-selection for forwarding to an upstream GraphQL
/// source. Fragments are flattened first; the upstream never sees them.
fn render_selection(
    doc: &ExecutableDocument,
    selection_set: &executable::SelectionSet,
) -> Option<String> {
    fn render_into(
        doc: &ExecutableDocument,
        selection_set: &executable::SelectionSet,
        out: &mut Vec<String>,
    ) {
        for selection in &selection_set.selections {
            match selection {
                executable::Selection::Field(field) => {
                    let mut rendered = field.name.as_str().to_string();
                    if let Some(nested) = render_selection(doc, &field.selection_set) {
                        rendered.push_str(&nested);
                    }
                    out.push(rendered);
                }
                executable::Selection::FragmentSpread(spread) => {
                    if let Some(fragment) = doc.fragments.get(&spread.fragment_name) {
                        render_into(doc, &fragment.selection_set, out);
                    }
                }
                executable::Selection::InlineFragment(inline) => {
                    render_into(doc, &inline.selection_set, out);
                }
            }
        }
    }

    if selection_set.selections.is_empty() {
        return None;
    }
    let mut fields = Vec::new();
    render_into(doc, selection_set, &mut fields);
    Some(format!(" {{ {} }}", fields.join(" ")))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;
    use crate::loader::test_support::StaticClient;

    fn service_from(config_json: &str, client: Arc<dyn UpstreamClient>) -> ExecutionService {
        let config = Config::from_json(config_json).unwrap();
        ExecutionService::from_config(&config, client).unwrap()
    }

    fn const_service() -> ExecutionService {
        service_from(
            r#"{
            "types": {
                "Query": {
                    "fields": {
                        "version": {"type": "String!", "const": "1.0"},
                        "limits": {"type": "Limits", "const": {"depth": 3, "rate": null}},
                        "broken": {"type": "String!", "const": null}
                    }
                },
                "Limits": {
                    "fields": {
                        "depth": {"type": "Int"},
                        "rate": {"type": "Int!"}
                    }
                }
            }
        }"#,
            Arc::new(StaticClient::default()),
        )
    }

    async fn run(service: &ExecutionService, query: &str) -> graphql::Response {
        service
            .execute(
                graphql::Request::builder().query(query).build(),
                &HeaderMap::new(),
            )
            .await
    }

    #[tokio::test]
    async fn resolves_constants_in_selection_order() {
        let service = const_service();
        let response = run(&service, "{ version limits { depth } }").await;
        assert!(response.errors.is_empty());
        assert_eq!(
            serde_json::to_string(&response.data.unwrap()).unwrap(),
            r#"{"version":"1.0","limits":{"depth":3}}"#
        );

        // Reversed selection order reverses the response object.
        let response = run(&service, "{ limits { depth } version }").await;
        assert_eq!(
            serde_json::to_string(&response.data.unwrap()).unwrap(),
            r#"{"limits":{"depth":3},"version":"1.0"}"#
        );
    }

    #[tokio::test]
    async fn aliases_rename_response_keys() {
        let service = const_service();
        let response = run(&service, "{ v: version }").await;
        assert_eq!(response.data, Some(json!({"v": "1.0"})));
    }

    #[tokio::test]
    async fn typename_resolves_without_a_field_step() {
        let service = const_service();
        let response = run(&service, "{ __typename version }").await;
        assert_eq!(
            response.data,
            Some(json!({"__typename": "Query", "version": "1.0"}))
        );
    }

    #[tokio::test]
    async fn invalid_documents_are_rejected_with_no_data() {
        let service = const_service();
        let response = run(&service, "{ nope }").await;
        assert!(response.data.is_none());
        assert_eq!(response.errors.len(), 1);
        assert_eq!(
            response.errors[0].extensions.get("code"),
            Some(&json!("GRAPHQL_VALIDATION_FAILED"))
        );
    }

    #[tokio::test]
    async fn null_in_non_null_bubbles_to_nullable_ancestor() {
        let service = const_service();
        // Limits.rate is Int! and the constant carries null: limits itself
        // must resolve to null, with an error pointing at the leaf.
        let response = run(&service, "{ limits { depth rate } }").await;
        assert_eq!(response.data, Some(json!({"limits": null})));
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].path.as_ref().unwrap().to_string(), "/limits/rate");
    }

    #[tokio::test]
    async fn non_null_root_failure_nullifies_data() {
        let service = const_service();
        let response = run(&service, "{ broken }").await;
        assert_eq!(response.data, Some(Value::Null));
        assert_eq!(response.errors.len(), 1);
    }

    #[tokio::test]
    async fn fragments_flatten_into_the_selection() {
        let service = const_service();
        let response = run(
            &service,
            "query { limits { ...L } } fragment L on Limits { depth }",
        )
        .await;
        assert_eq!(response.data, Some(json!({"limits": {"depth": 3}})));
    }

    #[tokio::test]
    async fn variables_feed_arguments() {
        let service = service_from(
            r#"{
            "upstream": {"baseUrl": "http://127.0.0.1:1"},
            "types": {
                "Query": {
                    "fields": {
                        "echo": {
                            "type": "String",
                            "args": {"word": {"type": "String"}},
                            "expr": {"dynamic": {"path": ["args", "word"]}}
                        }
                    }
                }
            }
        }"#,
            Arc::new(StaticClient::default()),
        );
        let response = service
            .execute(
                graphql::Request::builder()
                    .query("query E($w: String) { echo(word: $w) }")
                    .variables(
                        json!({"w": "hi"}).as_object().cloned().unwrap(),
                    )
                    .build(),
                &HeaderMap::new(),
            )
            .await;
        assert_eq!(response.data, Some(json!({"echo": "hi"})));
    }

    #[tokio::test]
    async fn defaults_apply_when_arguments_are_absent() {
        let service = service_from(
            r#"{
            "types": {
                "Query": {
                    "fields": {
                        "greet": {
                            "type": "String",
                            "args": {"name": {"type": "String", "default": "world"}},
                            "expr": {"dynamic": {"path": ["args", "name"]}}
                        }
                    }
                }
            }
        }"#,
            Arc::new(StaticClient::default()),
        );
        let response = run(&service, "{ greet }").await;
        assert_eq!(response.data, Some(json!({"greet": "world"})));
    }

    #[tokio::test]
    async fn unknown_operation_name_is_reported() {
        let service = const_service();
        let response = service
            .execute(
                graphql::Request::builder()
                    .query("query A { version }")
                    .operation_name("B")
                    .build(),
                &HeaderMap::new(),
            )
            .await;
        assert!(response.data.is_none());
        assert_eq!(
            response.errors[0].extensions.get("code"),
            Some(&json!("OPERATION_NOT_FOUND"))
        );
    }
}
