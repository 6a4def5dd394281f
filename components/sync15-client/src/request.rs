/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use url::percent_encoding::{utf8_percent_encode, DEFAULT_ENCODE_SET};

use util::ServerTimestamp;

header! { (XLastModified, "X-Last-Modified") => [ServerTimestamp] }
header! { (XIfModifiedSince, "X-If-Modified-Since") => [ServerTimestamp] }
header! { (XIfUnmodifiedSince, "X-If-Unmodified-Since") => [ServerTimestamp] }
header! { (XClientState, "X-Client-State") => [String] }

/// Builds the relative endpoint of a collection fetch, e.g.
/// `storage/history?newer=1234.56&full=true`.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRequest {
    pub collection: String,
    pub full: bool,
    pub newer: Option<ServerTimestamp>,
}

impl CollectionRequest {
    #[inline]
    pub fn new<S>(collection: S) -> CollectionRequest
    where
        S: Into<String>,
    {
        CollectionRequest {
            collection: collection.into(),
            full: false,
            newer: None,
        }
    }

    #[inline]
    pub fn full(mut self) -> CollectionRequest {
        self.full = true;
        self
    }

    #[inline]
    pub fn newer_than(mut self, ts: ServerTimestamp) -> CollectionRequest {
        self.newer = Some(ts);
        self
    }

    pub fn relative_url(&self) -> String {
        let mut url = format!("storage/{}", self.collection);
        let mut separator = '?';
        if let Some(ts) = self.newer {
            url.push_str(&format!("{}newer={}", separator, ts));
            separator = '&';
        }
        if self.full {
            url.push_str(&format!("{}full=true", separator));
        }
        url
    }
}

/// The relative endpoint of a single item. Firefox uses UUIDs with curly
/// braces as ids for some records; curly braces are unsafe in URLs and must
/// be escaped.
pub fn item_endpoint(collection: &str, id: &str) -> String {
    format!(
        "storage/{}/{}",
        collection,
        utf8_percent_encode(id, DEFAULT_ENCODE_SET)
    )
}
