//! Request variables visible to statement templates.
//!
//! | name | value |
//! |---|---|
//! | `arg_<name>` | query string argument |
//! | `http_<name>` | request header, `_` read as `-` |
//! | `cookie_<name>` | cookie value |
//! | `request_method`, `request_uri`, `uri`, `request_body` | request line and body |

use std::collections::HashMap;

use axum::http::{header, HeaderMap, Method, Uri};

#[derive(Debug, Clone, Default)]
pub struct RequestVars {
    method: String,
    request_uri: String,
    path: String,
    args: HashMap<String, String>,
    headers: HeaderMap,
    cookies: HashMap<String, String>,
    body: String,
}

impl RequestVars {
    pub fn new(method: &Method, uri: &Uri, headers: &HeaderMap, body: String) -> Self {
        let args = uri
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        let cookies = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| {
                let (k, v) = pair.trim().split_once('=')?;
                Some((k.to_string(), v.to_string()))
            })
            .collect();

        Self {
            method: method.as_str().to_string(),
            request_uri: uri.path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_default(),
            path: uri.path().to_string(),
            args,
            headers: headers.clone(),
            cookies,
            body,
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(arg) = name.strip_prefix("arg_") {
            return self.args.get(arg).cloned();
        }
        if let Some(field) = name.strip_prefix("http_") {
            let header_name = field.replace('_', "-");
            return self
                .headers
                .get(header_name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
        }
        if let Some(cookie) = name.strip_prefix("cookie_") {
            return self.cookies.get(cookie).cloned();
        }
        match name {
            "request_method" => Some(self.method.clone()),
            "request_uri" => Some(self.request_uri.clone()),
            "uri" => Some(self.path.clone()),
            "request_body" => Some(self.body.clone()),
            _ => None,
        }
    }
}
