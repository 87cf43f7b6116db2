//! Session instructions for the form-filling assistant.

use serde_json::Value;

/// Instructions telling the model to listen, fill the record described by
/// `schema`, and save it through the tool after every new piece of
/// information.
pub fn build_instructions(model_description: &str, schema: &Value) -> String {
    format!(
        "You are helping to edit a JSON object that represents a {model_description}.\n\
         This JSON object conforms to the following schema: {schema}\n\
         \n\
         Listen to the user and collect information from them. Do not reply to them unless they \
         explicitly ask for your input; just listen.\n\
         Each time they provide information that can be added to the JSON object, add it to the \
         existing object, and then call the tool to save the updated object. Don't stop updating \
         the JSON object.\n\
         Even if you think the information is incorrect, accept it - do not try to correct \
         mistakes.\n\
         After each time you have called the JSON updating tool, just reply OK."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn instructions_embed_description_and_compact_schema() {
        let schema = json!({ "type": "object", "properties": { "caseId": { "type": "string" } } });
        let text = build_instructions("tissue sample descriptor", &schema);
        assert!(text.contains("represents a tissue sample descriptor."));
        assert!(text.contains(r#"{"type":"object","properties":{"caseId":{"type":"string"}}}"#));
        assert!(text.ends_with("just reply OK."));
    }
}
