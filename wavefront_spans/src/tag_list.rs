//! Turns a span's raw tags into the tag list that is reported.
//!
//! Parsing in one pass also yields the component and error status, which the
//! RED metrics need separately from the tag list itself.

use std::collections::HashSet;

use crate::{
    application_tags::{NULL_TAG_VAL, SOURCE_KEY},
    ApplicationTags, Span, TraceContext,
};

pub const ERROR_TAG_KEY: &str = "error";
pub const DEBUG_TAG_KEY: &str = "debug";
pub const COMPONENT_TAG_KEY: &str = "component";
pub const SPAN_KIND_TAG_KEY: &str = "span.kind";
pub const SPAN_SECONDARY_ID_KEY: &str = "_spanSecondaryId";
pub const SPAN_LOG_KEY: &str = "_spanLogs";

/// The default tags and the keys spans may not override. Immutable once built.
#[derive(Debug, Clone)]
pub struct DefaultTags {
    tags: Vec<(String, String)>,
    reserved_keys: HashSet<String>,
}

impl DefaultTags {
    pub fn new(application_tags: &ApplicationTags) -> Self {
        let tags = application_tags.default_tags();
        let mut reserved_keys: HashSet<String> =
            tags.iter().map(|(key, _)| key.to_lowercase()).collect();
        reserved_keys.insert(SOURCE_KEY.to_string());
        Self {
            tags,
            reserved_keys,
        }
    }

    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    /// `key` must already be lowercase.
    pub fn is_reserved(&self, key: &str) -> bool {
        self.reserved_keys.contains(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagList {
    pub tags: Vec<(String, String)>,
    pub component: String,
    pub is_error: bool,
}

impl TagList {
    pub fn new(defaults: &DefaultTags, context: &TraceContext, span: &Span) -> Self {
        let mut tags = Vec::with_capacity(defaults.tags().len() + span.tags.len() + 4);
        let mut component = NULL_TAG_VAL.to_string();
        let mut is_error = span.error.is_some();
        let mut debug = context.debug;
        let has_annotations = !span.annotations.is_empty();

        tags.extend(defaults.tags().iter().cloned());
        for (key, value) in &span.tags {
            let lowercase_key = key.to_lowercase();
            if lowercase_key == ERROR_TAG_KEY {
                // Whatever the value was, even empty, it is reported as "true" below.
                is_error = true;
                continue;
            }
            if value.is_empty() || defaults.is_reserved(&lowercase_key) {
                continue;
            }
            if lowercase_key == DEBUG_TAG_KEY {
                debug = true;
                continue;
            }
            if lowercase_key == COMPONENT_TAG_KEY {
                component = value.clone();
            }
            tags.push((key.clone(), value.clone()));
        }

        if is_error {
            tags.push((ERROR_TAG_KEY.to_string(), "true".to_string()));
        }
        if debug {
            tags.push((DEBUG_TAG_KEY.to_string(), "true".to_string()));
        }
        if let Some(kind) = span.kind.as_tag_value() {
            tags.push((SPAN_KIND_TAG_KEY.to_string(), kind.to_string()));
            if has_annotations {
                tags.push((SPAN_SECONDARY_ID_KEY.to_string(), kind.to_string()));
            }
        }
        if has_annotations {
            tags.push((SPAN_LOG_KEY.to_string(), "true".to_string()));
        }
        if let Some(ip) = span.local_ip {
            let version = if ip.is_ipv6() { "ipv6" } else { "ipv4" };
            tags.push((version.to_string(), ip.to_string()));
        }

        Self {
            tags,
            component,
            is_error,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
