//! Open-ended key/value bag attached to transitions and line items.

use std::collections::BTreeMap;

/// String keys to arbitrary JSON values. Ordered so serialized output is stable.
pub type Metadata = BTreeMap<String, serde_json::Value>;
