//! Login form descriptions
//!
//! Each backend type describes the parameters it accepts so the upstream
//! application can render a login screen. An `enable` field toggles the
//! visibility of the fields whose ids it lists in `target`.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Hidden,
    Text,
    Password,
    Enable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormElement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub target: Vec<String>,
}

impl FormElement {
    fn new(name: &str, kind: FieldType) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            kind,
            value: None,
            placeholder: None,
            required: false,
            target: Vec::new(),
        }
    }

    /// Fixed value the user never sees
    pub fn hidden(name: &str, value: &str) -> Self {
        let mut element = Self::new(name, FieldType::Hidden);
        element.value = Some(value.to_string());
        element
    }

    pub fn text(name: &str, placeholder: &str) -> Self {
        let mut element = Self::new(name, FieldType::Text);
        element.placeholder = Some(placeholder.to_string());
        element
    }

    pub fn password(name: &str, placeholder: &str) -> Self {
        let mut element = Self::new(name, FieldType::Password);
        element.placeholder = Some(placeholder.to_string());
        element
    }

    /// Checkbox revealing the fields with the given ids
    pub fn toggle(name: &str, placeholder: &str, targets: &[&str]) -> Self {
        let mut element = Self::new(name, FieldType::Enable);
        element.placeholder = Some(placeholder.to_string());
        element.target = targets.iter().map(|t| t.to_string()).collect();
        element
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Ordered list of login fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Form {
    pub elements: Vec<FormElement>,
}

impl Form {
    pub fn new(elements: Vec<FormElement>) -> Self {
        Self { elements }
    }

    pub fn field(&self, name: &str) -> Option<&FormElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// Targets of every toggle must name an element id of this form
    pub fn dangling_targets(&self) -> Vec<&str> {
        self.elements
            .iter()
            .flat_map(|e| e.target.iter())
            .filter(|t| !self.elements.iter().any(|e| e.id.as_deref() == Some(t.as_str())))
            .map(String::as_str)
            .collect()
    }
}
