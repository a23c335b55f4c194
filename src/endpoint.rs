//! The templated description of an upstream HTTP call.

use std::fmt;

use bytes::Bytes;
use http::header::HeaderName;
use http::header::HeaderValue;
use http::header::CONTENT_LENGTH;
use http::header::CONTENT_TYPE;
use http::HeaderMap;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ResolverError;
use crate::http::UpstreamRequest;
use crate::template::Template;
use crate::value::DynamicValue;
use crate::value::TSchema;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Method {
    pub fn as_http(&self) -> http::Method {
        match self {
            Method::Get => http::Method::GET,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
            Method::Patch => http::Method::PATCH,
            Method::Delete => http::Method::DELETE,
            Method::Head => http::Method::HEAD,
            Method::Options => http::Method::OPTIONS,
        }
    }

    /// GET and DELETE (and the read-only methods) never carry a body.
    pub fn carries_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_http().as_str())
    }
}

/// An upstream endpoint whose path, query values, header values and body
/// may contain template parameters. Evaluating the endpoint against a
/// dynamic input produces a concrete [`UpstreamRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: Method,
    pub scheme: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub port: Option<u16>,
    pub path: Template,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub query: Vec<(String, Template)>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub headers: Vec<(String, Template)>,
    /// When present, the request body is this template's resolution
    /// (a single-parameter template projects the sub-value it names);
    /// otherwise the whole input serializes as the body.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub body: Option<Template>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub input: Option<TSchema>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output: Option<TSchema>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>) -> Endpoint {
        Endpoint {
            method: Method::default(),
            scheme: "http".to_string(),
            host: host.into(),
            port: None,
            path: Template::parse("/"),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            input: None,
            output: None,
        }
    }

    pub fn method(mut self, method: Method) -> Endpoint {
        self.method = method;
        self
    }

    pub fn scheme(mut self, scheme: impl Into<String>) -> Endpoint {
        self.scheme = scheme.into();
        self
    }

    pub fn port(mut self, port: u16) -> Endpoint {
        self.port = Some(port);
        self
    }

    pub fn path(mut self, path: &str) -> Endpoint {
        self.path = Template::parse(path);
        self
    }

    pub fn query_param(mut self, key: impl Into<String>, value: &str) -> Endpoint {
        self.query.push((key.into(), Template::parse(value)));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: &str) -> Endpoint {
        self.headers.push((name.into(), Template::parse(value)));
        self
    }

    pub fn body(mut self, template: &str) -> Endpoint {
        self.body = Some(Template::parse(template));
        self
    }

    pub fn output(mut self, schema: TSchema) -> Endpoint {
        self.output = Some(schema);
        self
    }

    /// Splits an absolute URL such as `http://api.example.com:8080/users`
    /// into scheme/host/port/path, keeping any query pairs as templates.
    pub fn from_url(url: &str) -> Result<Endpoint, url::ParseError> {
        let parsed = url::Url::parse(url)?;
        let host = parsed.host_str().ok_or(url::ParseError::EmptyHost)?;
        Ok(Endpoint {
            method: Method::default(),
            scheme: parsed.scheme().to_string(),
            host: host.to_string(),
            port: parsed.port(),
            path: Template::parse(parsed.path()),
            query: parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), Template::parse(&v)))
                .collect(),
            headers: Vec::new(),
            body: None,
            input: None,
            output: None,
        })
    }

    /// The canonical `scheme://host[:port]` prefix; default ports elide.
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) if !is_default_port(&self.scheme, port) => {
                format!("{}://{}:{}", self.scheme, self.host, port)
            }
            _ => format!("{}://{}", self.scheme, self.host),
        }
    }

    /// Substitutes every template against `input` and assembles the
    /// concrete request.
    pub fn evaluate(&self, input: &DynamicValue) -> Result<UpstreamRequest, ResolverError> {
        let rendered_path = self.path.resolve(input);
        let mut url = url::Url::parse(&format!("{}{}", self.authority(), rendered_path))
            .map_err(|e| {
                ResolverError::evaluation(format!("endpoint produced an invalid URL: {e}"))
            })?;
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, template) in &self.query {
                pairs.append_pair(key, &template.resolve(input));
            }
        }

        let body = if self.method.carries_body() {
            let value = match &self.body {
                Some(template) => template.resolve_typed(input),
                None => input.clone(),
            };
            Bytes::from(value.to_json_vec().map_err(|e| {
                ResolverError::evaluation(format!("endpoint body failed to serialize: {e}"))
            })?)
        } else {
            Bytes::new()
        };

        let mut headers = HeaderMap::with_capacity(self.headers.len() + 2);
        for (name, template) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ResolverError::evaluation(format!("invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(&template.resolve(input)).map_err(|e| {
                ResolverError::evaluation(format!("invalid value for header '{name}': {e}"))
            })?;
            headers.insert(name, value);
        }
        if !body.is_empty() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }

        Ok(UpstreamRequest {
            method: self.method,
            url,
            headers,
            body,
        })
    }
}

fn is_default_port(scheme: &str, port: u16) -> bool {
    matches!((scheme, port), ("http", 80) | ("https", 443))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dynamic;

    #[test]
    fn renders_path_and_query_params() {
        let endpoint = Endpoint::new("jsonplaceholder.typicode.com")
            .path("/users/{{args.id}}")
            .query_param("sort", "{{args.sort}}");
        let input = dynamic!({"args": {"id": 1, "sort": "asc"}});
        let request = endpoint.evaluate(&input).unwrap();
        assert_eq!(
            request.url.as_str(),
            "http://jsonplaceholder.typicode.com/users/1?sort=asc"
        );
        assert!(request.body.is_empty());
    }

    #[test]
    fn default_ports_do_not_appear() {
        let endpoint = Endpoint::new("api.example.com").port(80).path("/a");
        let request = endpoint.evaluate(&DynamicValue::Null).unwrap();
        assert_eq!(request.url.as_str(), "http://api.example.com/a");

        let endpoint = Endpoint::new("api.example.com").scheme("https").port(443).path("/a");
        let request = endpoint.evaluate(&DynamicValue::Null).unwrap();
        assert_eq!(request.url.as_str(), "https://api.example.com/a");
    }

    #[test]
    fn non_default_port_is_kept() {
        let endpoint = Endpoint::new("localhost").port(8090).path("/x");
        let request = endpoint.evaluate(&DynamicValue::Null).unwrap();
        assert_eq!(request.url.as_str(), "http://localhost:8090/x");
    }

    #[test]
    fn post_serializes_whole_input_with_content_headers() {
        let endpoint = Endpoint::new("api.example.com").method(Method::Post).path("/users");
        let input = dynamic!({"name": "Hans"});
        let request = endpoint.evaluate(&input).unwrap();
        assert_eq!(request.body.as_ref(), br#"{"name":"Hans"}"#);
        assert_eq!(
            request.headers.get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            request.headers.get(CONTENT_LENGTH).unwrap(),
            &request.body.len().to_string()
        );
    }

    #[test]
    fn body_template_projects_a_sub_value() {
        let endpoint = Endpoint::new("api.example.com")
            .method(Method::Post)
            .path("/companies")
            .body("{{value.company}}");
        let input = dynamic!({"value": {"id": 1, "company": {"name": "FOO"}}});
        let request = endpoint.evaluate(&input).unwrap();
        assert_eq!(request.body.as_ref(), br#"{"name":"FOO"}"#);
    }

    #[test]
    fn get_and_delete_never_carry_a_body() {
        for method in [Method::Get, Method::Delete] {
            let endpoint = Endpoint::new("api.example.com")
                .method(method)
                .path("/users/1")
                .body("{{value}}");
            let request = endpoint.evaluate(&dynamic!({"value": 1})).unwrap();
            assert!(request.body.is_empty());
            assert!(request.headers.get(CONTENT_LENGTH).is_none());
        }
    }

    #[test]
    fn header_values_are_templated() {
        let endpoint = Endpoint::new("api.example.com")
            .path("/posts/{{headers.authorization}}")
            .header("x-tenant", "{{vars.tenant}}");
        let input = dynamic!({"headers": {"authorization": "1"}, "vars": {"tenant": "acme"}});
        let request = endpoint.evaluate(&input).unwrap();
        assert_eq!(request.url.as_str(), "http://api.example.com/posts/1");
        assert_eq!(request.headers.get("x-tenant").unwrap(), "acme");
    }

    #[test]
    fn from_url_splits_the_authority() {
        let endpoint = Endpoint::from_url("http://localhost:8090/users?active=true").unwrap();
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, Some(8090));
        assert_eq!(endpoint.path.to_string(), "/users");
        assert_eq!(endpoint.query.len(), 1);
        assert_eq!(endpoint.authority(), "http://localhost:8090");
    }
}
