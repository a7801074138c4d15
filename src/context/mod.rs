//! Per-request context: the request, its path parameters and typed
//! extensions.
//!
//! The cache inserts the negotiated [`MediaType`] into the extensions before
//! it runs a handler, so one handler can serve several representations.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use crate::Request;
use crate::negotiate::MediaType;

/// Type-erased request extensions map, used to inject per-request state
/// into handlers without requiring handlers to know about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
            .map(|previous| *previous)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Path parameters extracted from the matched route.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    map: HashMap<String, String>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: String) {
        self.map.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Everything a handler gets for one request.
pub struct Context {
    request: Request,
    params: Parameters,
    extensions: Extensions,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self::with_params(request, Parameters::new())
    }

    pub fn with_params(request: Request, params: Parameters) -> Self {
        Self {
            request,
            params,
            extensions: Extensions::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The media type negotiated for this request, when the route is cached.
    pub fn media_type(&self) -> Option<&MediaType> {
        self.extensions.get::<MediaType>()
    }

    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Headers, Method};

    #[test]
    fn extensions_are_typed() {
        let mut ext = Extensions::new();
        assert_eq!(ext.insert(5u32), None);
        assert_eq!(ext.insert(7u32), Some(5));
        ext.insert("label");
        assert_eq!(ext.get::<u32>(), Some(&7));
        assert_eq!(ext.get::<&str>(), Some(&"label"));
        if let Some(v) = ext.get_mut::<u32>() {
            *v += 1;
        }
        assert_eq!(ext.remove::<u32>(), Some(8));
        assert_eq!(ext.get::<u32>(), None);
    }

    #[test]
    fn media_type_comes_from_extensions() {
        let mut ctx = Context::new(Request::new(Method::Get, "/", Headers::new()));
        assert!(ctx.media_type().is_none());
        ctx.extensions_mut().insert(MediaType::text_html());
        assert_eq!(ctx.media_type(), Some(&MediaType::text_html()));
    }

    #[test]
    fn json_body() {
        let request = Request::new(Method::Post, "/items", Headers::new())
            .with_body(r#"{"count": 3}"#);
        let ctx = Context::new(request);
        let value: serde_json::Value = ctx.json().unwrap();
        assert_eq!(value["count"], 3);
    }
}
