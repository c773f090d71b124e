// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Predicates deciding whether a [Message] satisfies a hook
//!
//! A matcher combines a type test (exact name, membership in a list, a route template for
//! request/response protocols, or an arbitrary predicate over the whole message) with an
//! optional predicate over the payload. Both must pass for the matcher to accept a message.
use regex::Regex;
use serde_json::Value;
use std::{
  collections::BTreeMap,
  fmt,
  panic::{catch_unwind, AssertUnwindSafe},
  sync::Arc,
};

use super::message::Message;

pub type PayloadPredicate = Arc<dyn Fn(&Value) -> anyhow::Result<bool> + Send + Sync>;
pub type MessagePredicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// The `messageType` parameter of a hook-producing step
#[derive(Clone)]
pub enum MessageTypeSpec {
  Exact(String),
  AnyOf(Vec<String>),
  Custom(MessagePredicate),
}

impl MessageTypeSpec {
  pub fn custom<F>(predicate: F) -> Self
  where
    F: Fn(&Message) -> bool + Send + Sync + 'static,
  {
    Self::Custom(Arc::new(predicate))
  }
}

impl fmt::Debug for MessageTypeSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Exact(name) => f.debug_tuple("Exact").field(name).finish(),
      Self::AnyOf(names) => f.debug_tuple("AnyOf").field(names).finish(),
      Self::Custom(_) => f.debug_tuple("Custom").finish_non_exhaustive(),
    }
  }
}

impl From<&str> for MessageTypeSpec {
  fn from(name: &str) -> Self {
    Self::Exact(name.to_owned())
  }
}

impl From<String> for MessageTypeSpec {
  fn from(name: String) -> Self {
    Self::Exact(name)
  }
}

impl From<Vec<String>> for MessageTypeSpec {
  fn from(names: Vec<String>) -> Self {
    Self::AnyOf(names)
  }
}

impl From<&[&str]> for MessageTypeSpec {
  fn from(names: &[&str]) -> Self {
    Self::AnyOf(names.iter().map(|name| (*name).to_owned()).collect())
  }
}

impl<const N: usize> From<[&str; N]> for MessageTypeSpec {
  fn from(names: [&str; N]) -> Self {
    Self::from(&names[..])
  }
}

#[derive(Clone, Default)]
pub struct MatcherOptions {
  pub payload: Option<PayloadPredicate>,
  /// Whether type names may carry route templates (`GET /users/{id}`)
  pub templated: bool,
}

/// A compiled `[METHOD ]/path/{param}/:param` template
///
/// Compiled once into an anchored pattern; matching a path first compares segment counts
/// so mismatched shapes never reach the regex. Parameters whose names are valid regex group
/// names become named groups; any other name (`{user-id}`, a repeated name) falls back to a
/// positional group. Captures are always read back in template order, so both kinds resolve
/// to the name written in the template.
#[derive(Clone)]
pub struct RouteTemplate {
  source: String,
  method: Option<String>,
  segments: usize,
  pattern: Regex,
  params: Vec<String>,
}

impl RouteTemplate {
  pub fn parse(template: &str) -> Self {
    let (method, path) = split_method(template.trim());
    let mut params = Vec::new();
    let mut pattern = String::with_capacity(path.len() + 16);
    pattern.push('^');
    for (index, segment) in path.split('/').enumerate() {
      if index > 0 {
        pattern.push('/');
      }
      match parameter_name(segment) {
        Some(name) => {
          if is_group_name(name) && !params.iter().any(|seen| seen == name) {
            pattern.push_str(&format!("(?P<{}>[^/]+)", name));
          } else {
            pattern.push_str("([^/]+)");
          }
          params.push(name.to_owned());
        }
        None => pattern.push_str(&regex::escape(segment)),
      }
    }
    pattern.push('$');
    Self {
      source: template.trim().to_owned(),
      method: method.map(str::to_owned),
      segments: path.split('/').count(),
      pattern: Regex::new(&pattern).expect("Escaped route pattern must always compile"),
      params,
    }
  }

  pub fn has_parameters(template: &str) -> bool {
    let (_, path) = split_method(template.trim());
    path.split('/').any(|segment| parameter_name(segment).is_some())
  }

  pub fn source(&self) -> &str {
    &self.source
  }

  pub fn method(&self) -> Option<&str> {
    self.method.as_deref()
  }

  /// Captures parameters from a bare path, ignoring any method constraint
  pub fn match_path(&self, path: &str) -> Option<BTreeMap<String, String>> {
    let path = strip_query(path);
    if path.split('/').count() != self.segments {
      return None;
    }
    let captures = self.pattern.captures(path)?;
    Some(
      self
        .params
        .iter()
        .zip(captures.iter().skip(1))
        .filter_map(|(name, value)| value.map(|value| (name.clone(), value.as_str().to_owned())))
        .collect(),
    )
  }

  /// Matches a request line such as `get /users/7?verbose=1`
  pub fn match_request(&self, request: &str) -> Option<BTreeMap<String, String>> {
    let (method, path) = split_method(request.trim());
    if let Some(expected) = &self.method {
      match method {
        Some(method) if method.eq_ignore_ascii_case(expected) => {}
        _ => return None,
      }
    }
    self.match_path(path)
  }
}

impl fmt::Debug for RouteTemplate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RouteTemplate")
      .field("source", &self.source)
      .field("params", &self.params)
      .finish_non_exhaustive()
  }
}

/// One-shot template match, compiling `template` on every call
pub fn match_path(path: &str, template: &str) -> Option<BTreeMap<String, String>> {
  RouteTemplate::parse(template).match_path(path)
}

fn split_method(request: &str) -> (Option<&str>, &str) {
  match request.split_once(char::is_whitespace) {
    Some((method, path)) if !method.starts_with('/') => (Some(method), path.trim_start()),
    _ => (None, request),
  }
}

fn strip_query(path: &str) -> &str {
  path
    .split_once(|c: char| c == '?' || c == '#')
    .map_or(path, |(path, _)| path)
}

fn is_group_name(name: &str) -> bool {
  let mut chars = name.chars();
  matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parameter_name(segment: &str) -> Option<&str> {
  if let Some(name) = segment
    .strip_prefix('{')
    .and_then(|rest| rest.strip_suffix('}'))
  {
    return Some(name).filter(|name| !name.is_empty());
  }
  segment.strip_prefix(':').filter(|name| !name.is_empty())
}

#[derive(Clone)]
enum TypeTest {
  Exact(String),
  AnyOf(Vec<String>),
  Routes(Vec<RouteTemplate>),
  Custom(MessagePredicate),
}

#[derive(Clone)]
pub struct Matcher {
  test: TypeTest,
  payload: Option<PayloadPredicate>,
}

pub fn build_matcher(spec: MessageTypeSpec, options: MatcherOptions) -> Matcher {
  let is_route = |name: &String| options.templated && name.contains('/');
  let test = match spec {
    MessageTypeSpec::Exact(name) if is_route(&name) => {
      TypeTest::Routes(vec![RouteTemplate::parse(&name)])
    }
    MessageTypeSpec::Exact(name) => TypeTest::Exact(name),
    MessageTypeSpec::AnyOf(names) if names.iter().any(is_route) => TypeTest::Routes(
      names
        .iter()
        .map(|name| RouteTemplate::parse(name))
        .collect(),
    ),
    MessageTypeSpec::AnyOf(names) => TypeTest::AnyOf(names),
    MessageTypeSpec::Custom(predicate) => TypeTest::Custom(predicate),
  };
  Matcher {
    test,
    payload: options.payload,
  }
}

impl Matcher {
  pub fn matches(&self, message: &Message) -> bool {
    let type_matches = match &self.test {
      TypeTest::Exact(name) => &message.message_type == name,
      TypeTest::AnyOf(names) => names.iter().any(|name| &message.message_type == name),
      TypeTest::Routes(routes) => routes
        .iter()
        .any(|route| route.match_request(&message.message_type).is_some()),
      TypeTest::Custom(predicate) => contained(|| predicate(message)),
    };
    type_matches && self.payload_matches(&message.payload)
  }

  /// Route captures for a message this matcher accepts; `None` for non-route matchers
  pub fn route_params(&self, message: &Message) -> Option<BTreeMap<String, String>> {
    match &self.test {
      TypeTest::Routes(routes) => routes
        .iter()
        .find_map(|route| route.match_request(&message.message_type)),
      _ => None,
    }
  }

  fn payload_matches(&self, payload: &Value) -> bool {
    match &self.payload {
      None => true,
      Some(predicate) => contained(|| match predicate(payload) {
        Ok(matched) => matched,
        Err(e) => {
          tracing::trace!(error = %e, "Payload predicate failed; treating as no match");
          false
        }
      }),
    }
  }
}

/// Runs a user predicate, treating a panic inside it as "no match"
fn contained(predicate: impl FnOnce() -> bool) -> bool {
  catch_unwind(AssertUnwindSafe(predicate)).unwrap_or_else(|_| {
    tracing::warn!("Matcher predicate panicked; treating as no match");
    false
  })
}

impl fmt::Debug for Matcher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut s = f.debug_struct("Matcher");
    match &self.test {
      TypeTest::Exact(name) => s.field("type", name),
      TypeTest::AnyOf(names) => s.field("any_of", names),
      TypeTest::Routes(routes) => s.field("routes", routes),
      TypeTest::Custom(_) => s.field("custom", &true),
    };
    s.field("payload_predicate", &self.payload.is_some())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::{build_matcher, match_path, MatcherOptions, MessageTypeSpec, RouteTemplate};
  use crate::common::message::Message;
  use serde_json::json;
  use std::sync::Arc;

  fn templated() -> MatcherOptions {
    MatcherOptions {
      templated: true,
      ..Default::default()
    }
  }

  #[test]
  fn exact_and_membership() {
    let exact = build_matcher("Ping".into(), Default::default());
    assert!(exact.matches(&Message::new("Ping", json!(null))));
    assert!(!exact.matches(&Message::new("Pong", json!(null))));

    let any = build_matcher(["Ping", "Pong"].into(), Default::default());
    assert!(any.matches(&Message::new("Pong", json!(null))));
    assert!(!any.matches(&Message::new("Pang", json!(null))));
  }

  #[test]
  fn payload_predicate_must_also_pass() {
    let matcher = build_matcher(
      "Login".into(),
      MatcherOptions {
        payload: Some(Arc::new(|payload: &serde_json::Value| Ok(payload["user"] == "alice"))),
        templated: false,
      },
    );
    assert!(matcher.matches(&Message::new("Login", json!({"user": "alice"}))));
    assert!(!matcher.matches(&Message::new("Login", json!({"user": "bob"}))));
    assert!(!matcher.matches(&Message::new("Other", json!({"user": "alice"}))));
  }

  #[test]
  fn failing_payload_predicate_is_no_match() {
    let matcher = build_matcher(
      "Login".into(),
      MatcherOptions {
        payload: Some(Arc::new(|_: &serde_json::Value| Err(anyhow::anyhow!("boom")))),
        templated: false,
      },
    );
    assert!(!matcher.matches(&Message::new("Login", json!({}))));
  }

  #[test]
  fn panicking_predicates_are_no_match() {
    let payload = build_matcher(
      "Login".into(),
      MatcherOptions {
        payload: Some(Arc::new(|payload: &serde_json::Value| {
          Ok(payload["user"].as_str().unwrap().starts_with('a'))
        })),
        templated: false,
      },
    );
    assert!(!payload.matches(&Message::new("Login", json!({"user": 5}))));
    assert!(payload.matches(&Message::new("Login", json!({"user": "alice"}))));

    let custom = build_matcher(
      MessageTypeSpec::custom(|message| message.payload["n"].as_u64().unwrap() > 1),
      Default::default(),
    );
    assert!(!custom.matches(&Message::new("Any", json!({}))));
    assert!(custom.matches(&Message::new("Any", json!({"n": 2}))));
  }

  #[test]
  fn custom_type_predicate() {
    let matcher = build_matcher(
      MessageTypeSpec::custom(|message| message.message_type.starts_with("User")),
      Default::default(),
    );
    assert!(matcher.matches(&Message::new("UserCreated", json!(null))));
    assert!(!matcher.matches(&Message::new("OrderCreated", json!(null))));
  }

  #[test]
  fn path_templates() {
    let params = match_path("/users/123", "/users/{id}").expect("Must match");
    assert_eq!(params.get("id").map(String::as_str), Some("123"));
    assert!(match_path("/users", "/users/{id}").is_none());
    assert!(match_path("/users/123/posts", "/users/{id}/posts").is_some());
    assert!(match_path("/users/123/comments", "/users/{id}/posts").is_none());
  }

  #[test]
  fn colon_parameters_and_multiple_captures() {
    let params = match_path("/orgs/acme/repos/hookwire", "/orgs/:org/repos/{repo}").unwrap();
    assert_eq!(params["org"], "acme");
    assert_eq!(params["repo"], "hookwire");
  }

  #[test]
  fn parameter_names_need_not_be_identifiers() {
    let route = RouteTemplate::parse("/users/{user-id}/posts/{id}");
    let params = route.match_path("/users/u7/posts/p9").unwrap();
    assert_eq!(params["user-id"], "u7");
    assert_eq!(params["id"], "p9");

    let repeated = match_path("/a/1/b/2", "/a/{x}/b/{x}").unwrap();
    assert_eq!(repeated.len(), 1);
    assert!(["1", "2"].contains(&repeated["x"].as_str()));
  }

  #[test]
  fn literal_segments_are_not_patterns() {
    assert!(match_path("/files/aXb", "/files/a.b").is_none());
    assert!(match_path("/files/a.b", "/files/a.b").is_some());
  }

  #[test]
  fn method_comparison_is_case_insensitive() {
    let route = RouteTemplate::parse("GET /users/{id}");
    assert!(route.match_request("get /users/9").is_some());
    assert!(route.match_request("POST /users/9").is_none());
    assert!(route.match_request("/users/9").is_none());
    assert_eq!(route.method(), Some("GET"));
  }

  #[test]
  fn query_strings_are_ignored() {
    let route = RouteTemplate::parse("GET /search/{term}");
    let params = route.match_request("GET /search/rust?page=2").unwrap();
    assert_eq!(params["term"], "rust");
  }

  #[test]
  fn templated_matchers_expose_params() {
    let matcher = build_matcher("GET /users/{id}".into(), templated());
    let message = Message::new("GET /users/42", json!(null));
    assert!(matcher.matches(&message));
    assert_eq!(matcher.route_params(&message).unwrap()["id"], "42");
    assert!(!matcher.matches(&Message::new("GET /users", json!(null))));
  }

  #[test]
  fn templates_are_plain_names_without_template_support() {
    let matcher = build_matcher("GET /users/{id}".into(), Default::default());
    assert!(!matcher.matches(&Message::new("GET /users/42", json!(null))));
    assert!(matcher.matches(&Message::new("GET /users/{id}", json!(null))));
  }

  #[test]
  fn detects_parameters() {
    assert!(RouteTemplate::has_parameters("/users/{id}"));
    assert!(RouteTemplate::has_parameters("DELETE /users/:id"));
    assert!(!RouteTemplate::has_parameters("/users"));
  }
}
