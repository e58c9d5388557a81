//! Route construction and rate-limit bucket key derivation.
//!
//! A [`Route`] is built segment by segment so the resulting path never holds
//! an unresolved placeholder. Every dynamic segment is percent-escaped into
//! the path and remembered by name so a [`BucketKeyPolicy`] can derive the
//! bucket key from the route's shape instead of its concrete values.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// HTTP methods used by REST routes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Method {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// One path segment of a route, before substitution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Segment {
    /// Fixed text such as `channels` or `@me`.
    Literal(Cow<'static, str>),
    /// A dynamic value with the parameter name it was supplied for.
    Param { name: &'static str, value: String },
}

/// Derives the bucket key for a route from its method and segments.
///
/// Implementations must be pure: two call sites building the same route
/// shape have to land on the same key to share a bucket.
pub trait BucketKeyPolicy: Send + Sync + fmt::Debug {
    fn bucket_key(&self, method: Method, segments: &[Segment]) -> String;
}

/// Default policy: dynamic segments collapse to `{id}`.
///
/// Parameters registered as limiting keep their concrete value in the key,
/// which splits one route shape into one bucket per value.
#[derive(Clone, Debug, Default)]
pub struct ShapeBucketPolicy {
    limiting: HashSet<&'static str>,
}

impl ShapeBucketPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `param` as a limiting resource so its value is kept in the key.
    pub fn with_limiting(mut self, param: &'static str) -> Self {
        self.limiting.insert(param);
        self
    }
}

impl BucketKeyPolicy for ShapeBucketPolicy {
    fn bucket_key(&self, method: Method, segments: &[Segment]) -> String {
        let shape = segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.as_ref().to_string(),
                Segment::Param { name, value } if self.limiting.contains(name) => value.clone(),
                Segment::Param { .. } => "{id}".to_string(),
            })
            .collect::<Vec<_>>()
            .join("/");
        format!("{method} {shape}")
    }
}

/// A fully resolved REST operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Route {
    method: Method,
    path: String,
    bucket_key: String,
}

impl Route {
    /// Starts a route using the default [`ShapeBucketPolicy`].
    pub fn builder(method: Method) -> RouteBuilder {
        RouteBuilder::new(method)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Path relative to the versioned API root, without a leading slash.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn bucket_key(&self) -> &str {
        &self.bucket_key
    }

    /// `GET users/{user_id}`
    pub fn get_user(user_id: u64) -> Self {
        Self::builder(Method::Get)
            .literal("users")
            .param("user_id", user_id)
            .build()
    }

    /// `GET users/@me`
    pub fn current_user() -> Self {
        Self::builder(Method::Get).literal("users").literal("@me").build()
    }

    /// `PATCH users/@me`
    pub fn edit_current_user() -> Self {
        Self::builder(Method::Patch)
            .literal("users")
            .literal("@me")
            .build()
    }

    /// `POST channels/{channel_id}/messages`
    pub fn create_message(channel_id: u64) -> Self {
        Self::builder(Method::Post)
            .literal("channels")
            .param("channel_id", channel_id)
            .literal("messages")
            .build()
    }

    /// `POST interactions/{interaction_id}/{interaction_token}/callback`
    pub fn interaction_callback(interaction_id: u64, interaction_token: &str) -> Self {
        Self::builder(Method::Post)
            .literal("interactions")
            .param("interaction_id", interaction_id)
            .param("interaction_token", interaction_token)
            .literal("callback")
            .build()
    }

    /// `POST applications/{application_id}/commands`
    pub fn create_application_command(application_id: u64) -> Self {
        Self::builder(Method::Post)
            .literal("applications")
            .param("application_id", application_id)
            .literal("commands")
            .build()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Incremental builder for [`Route`].
#[derive(Clone, Debug)]
pub struct RouteBuilder {
    method: Method,
    segments: Vec<Segment>,
    policy: Option<Arc<dyn BucketKeyPolicy>>,
}

impl RouteBuilder {
    fn new(method: Method) -> Self {
        Self {
            method,
            segments: Vec::new(),
            policy: None,
        }
    }

    /// Appends a fixed segment. Literals are written to the path verbatim.
    pub fn literal(mut self, text: impl Into<Cow<'static, str>>) -> Self {
        self.segments.push(Segment::Literal(text.into()));
        self
    }

    /// Appends a dynamic segment; its value is percent-escaped in the path.
    pub fn param(mut self, name: &'static str, value: impl fmt::Display) -> Self {
        self.segments.push(Segment::Param {
            name,
            value: value.to_string(),
        });
        self
    }

    /// Overrides the bucket key policy for this route.
    pub fn policy(mut self, policy: Arc<dyn BucketKeyPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> Route {
        let path = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.as_ref().to_string(),
                Segment::Param { value, .. } => urlencoding::encode(value).into_owned(),
            })
            .collect::<Vec<_>>()
            .join("/");

        let bucket_key = match self.policy.as_deref() {
            Some(policy) => policy.bucket_key(self.method, &self.segments),
            None => ShapeBucketPolicy::default().bucket_key(self.method, &self.segments),
        };

        Route {
            method: self.method,
            path,
            bucket_key,
        }
    }
}
