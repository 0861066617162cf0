//! Intrinsic function helpers

use serde_json::{json, Map, Value};

/// `Fn::Join`
pub fn join(separator: &str, parts: Vec<Value>) -> Value {
    json!({ "Fn::Join": [separator, parts] })
}

/// `Fn::Sub` over pseudo parameters only
pub fn sub(template: &str) -> Value {
    json!({ "Fn::Sub": template })
}

/// `Fn::Sub` with a variable map
pub fn sub_with(template: &str, vars: &[(&str, Value)]) -> Value {
    let map: Map<String, Value> = vars
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect();
    json!({ "Fn::Sub": [template, map] })
}

/// `Fn::ImportValue`
pub fn import_value(export_name: &str) -> Value {
    json!({ "Fn::ImportValue": export_name })
}

/// `Fn::Select`
pub fn select(index: usize, list: Value) -> Value {
    json!({ "Fn::Select": [index, list] })
}

/// `Fn::Split`
pub fn split(separator: &str, source: Value) -> Value {
    json!({ "Fn::Split": [separator, source] })
}

/// `Fn::GetAZs` for the stack region
pub fn get_azs() -> Value {
    json!({ "Fn::GetAZs": "" })
}
