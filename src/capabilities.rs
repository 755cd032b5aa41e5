//! Static capability descriptors keyed by model-name substring.
//!
//! Single source of truth for the thinking controls a given model exposes;
//! the frontend fetches these to configure its UI dynamically. When new
//! model families ship, update only this file.

use serde_json::{json, Value};

/// Capability descriptor for one model id.
pub fn capabilities_for(model_id: &str) -> Value {
    let model = model_id.to_ascii_lowercase();
    let gen3 = model.contains("gemini-3") || model.contains("gemini3");

    if gen3 && model.contains("flash") {
        return json!({
            "thinkingType": "level",
            "levels": ["minimal", "low", "medium", "high"],
            "defaultLevel": "high",
            "supportsGoogleSearch": true,
        });
    }
    if gen3 && model.contains("pro") {
        return json!({
            "thinkingType": "level",
            "levels": ["low", "high"],
            "defaultLevel": "high",
            "supportsGoogleSearch": true,
        });
    }
    if model.contains("gemini-2.5-pro") || model.contains("gemini-2.5pro") {
        return json!({
            "thinkingType": "budget",
            "alwaysOn": true,
            "budgetRange": [1024, 32768],
            "defaultBudget": 32768,
            "supportsGoogleSearch": true,
        });
    }
    if model.contains("gemini-2.5-flash")
        || model.contains("gemini-2.5flash")
        || model == "gemini-flash-latest"
        || model == "gemini-flash-lite-latest"
    {
        return json!({
            "thinkingType": "budget",
            "alwaysOn": false,
            "budgetRange": [512, 24576],
            "defaultBudget": 24576,
            "supportsGoogleSearch": true,
        });
    }
    if model.contains("gemini-2.0") || model.contains("gemini2.0") {
        return json!({
            "thinkingType": "none",
            "supportsGoogleSearch": false,
        });
    }
    if model.contains("gemini-robotics") {
        return json!({
            "thinkingType": "none",
            "supportsGoogleSearch": true,
        });
    }

    json!({
        "thinkingType": "none",
        "supportsGoogleSearch": true,
    })
}

/// All known categories, for the parameterless endpoint.
pub fn all_categories() -> Value {
    json!({
        "categories": {
            "gemini3Flash": capabilities_for("gemini-3-flash"),
            "gemini3Pro": capabilities_for("gemini-3-pro"),
            "gemini25Pro": capabilities_for("gemini-2.5-pro"),
            "gemini25Flash": capabilities_for("gemini-2.5-flash"),
            "gemini20": capabilities_for("gemini-2.0-flash"),
            "default": capabilities_for("other"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_models() {
        let caps = capabilities_for("gemini-3-flash-preview");
        assert_eq!(caps["thinkingType"], "level");
        assert_eq!(caps["levels"].as_array().unwrap().len(), 4);

        let caps = capabilities_for("gemini-3-pro");
        assert_eq!(caps["levels"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn budget_models() {
        let caps = capabilities_for("gemini-2.5-pro");
        assert_eq!(caps["thinkingType"], "budget");
        assert_eq!(caps["alwaysOn"], true);

        let caps = capabilities_for("gemini-2.5-flash");
        assert_eq!(caps["alwaysOn"], false);
    }

    #[test]
    fn no_thinking_and_search_flags() {
        let caps = capabilities_for("gemini-2.0-flash");
        assert_eq!(caps["thinkingType"], "none");
        assert_eq!(caps["supportsGoogleSearch"], false);

        let caps = capabilities_for("some-unknown-model");
        assert_eq!(caps["thinkingType"], "none");
        assert_eq!(caps["supportsGoogleSearch"], true);
    }
}
