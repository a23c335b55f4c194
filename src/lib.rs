//! Query execution core for a configuration-driven GraphQL orchestration
//! gateway.
//!
//! Operators describe a GraphQL schema whose fields are bound to upstream
//! REST or GraphQL endpoints. That description compiles into an immutable,
//! content-addressed [`Blueprint`]; an [`ExecutionService`] serves queries
//! against it by planning, deduplicating and batching the upstream calls
//! behind each field.
//!
//! The pipeline, leaves first: [`Template`] substitution and
//! [`Endpoint`] evaluation produce upstream requests; [`Expression`]s
//! encode field resolvers and are interpreted by
//! [`Evaluator`](expression::Evaluator); the per-request
//! [`DataLoader`](loader::DataLoader) collapses duplicate and batchable
//! calls; the process-wide [`HttpCache`](http::HttpCache) honors upstream
//! cache headers; the step generator and execution service glue the tree
//! together while preserving GraphQL's ordering and error semantics.

#![warn(rust_2018_idioms)]

mod blueprint;
mod config;
mod endpoint;
mod error;
mod expression;
pub mod graphql;
mod http;
mod json_ext;
mod loader;
mod plan;
mod template;
mod value;

pub use blueprint::compile;
pub use blueprint::ArgDef;
pub use blueprint::Batching;
pub use blueprint::Blueprint;
pub use blueprint::Digest;
pub use blueprint::FieldDef;
pub use blueprint::FieldTypeRef;
pub use blueprint::SchemaRoots;
pub use blueprint::ServerSettings;
pub use blueprint::TypeDef;
pub use blueprint::UpstreamSettings;
pub use config::Config;
pub use endpoint::Endpoint;
pub use endpoint::Method;
pub use error::CompileError;
pub use error::ResolverError;
pub use expression::BindingAllocator;
pub use expression::BindingId;
pub use expression::Context;
pub use expression::Evaluator;
pub use expression::Expression;
pub use expression::ResolverCache;
pub use http::ClientService;
pub use http::HttpCache;
pub use http::UpstreamClient;
pub use http::UpstreamRequest;
pub use http::UpstreamResponse;
pub use json_ext::Path;
pub use json_ext::PathElement;
pub use loader::DataLoader;
pub use loader::Fingerprint;
pub use loader::LoaderSettings;
pub use plan::ExecutionService;
pub use template::Template;
pub use value::DynamicValue;
pub use value::TSchema;

pub use expression::Dict;
pub use expression::Dynamic;
pub use expression::GraphQLCall;
pub use expression::JsonTransform;
pub use expression::Logical;
pub use expression::Math;
pub use expression::Opt;
pub use expression::Unsafe;
