//! XEP-0004: Data Forms.
//!
//! Thin value objects only: parse a `jabber:x:data` element into fields,
//! fill values, serialize a submission. Rendering is the application's
//! problem. When a form signature key/secret pair is configured, submitted
//! forms carry the key and an HMAC-MD5 over the field values as hidden
//! fields.

use hmac::{Hmac, Mac};
use md5::Md5;
use minidom::Element;

use crate::error::XmppError;
use crate::parser::ns;

type HmacMd5 = Hmac<Md5>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormType {
    Form,
    Submit,
    Result,
    Cancel,
}

impl FormType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormType::Form => "form",
            FormType::Submit => "submit",
            FormType::Result => "result",
            FormType::Cancel => "cancel",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "form" => FormType::Form,
            "submit" => FormType::Submit,
            "result" => FormType::Result,
            "cancel" => FormType::Cancel,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub var: String,
    /// Field type attribute (`text-single`, `hidden`, `list-single`, …)
    pub type_: Option<String>,
    pub label: Option<String>,
    pub values: Vec<String>,
    /// `(label, value)` pairs for list fields
    pub options: Vec<(Option<String>, String)>,
    pub required: bool,
}

impl FormField {
    pub fn new(var: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            type_: None,
            label: None,
            values: Vec::new(),
            options: Vec::new(),
            required: false,
        }
    }

    pub fn with_value(var: impl Into<String>, value: impl Into<String>) -> Self {
        let mut field = Self::new(var);
        field.values.push(value.into());
        field
    }

    pub fn hidden(var: impl Into<String>, value: impl Into<String>) -> Self {
        let mut field = Self::with_value(var, value);
        field.type_ = Some("hidden".to_string());
        field
    }

    pub fn value(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataForm {
    pub type_: FormType,
    pub title: Option<String>,
    pub instructions: Option<String>,
    pub fields: Vec<FormField>,
}

impl DataForm {
    pub fn new(type_: FormType) -> Self {
        Self {
            type_,
            title: None,
            instructions: None,
            fields: Vec::new(),
        }
    }

    pub fn from_element(x: &Element) -> Result<Self, XmppError> {
        if x.name() != "x" || x.ns() != ns::DATA_FORMS {
            return Err(XmppError::xml_parse("not a data form element"));
        }

        let type_ = x
            .attr("type")
            .and_then(FormType::from_str)
            .ok_or_else(|| XmppError::xml_parse("data form lacks a valid type"))?;

        let mut form = DataForm::new(type_);
        for child in x.children() {
            match child.name() {
                "title" => form.title = Some(child.text()),
                "instructions" => form.instructions = Some(child.text()),
                "field" => {
                    let mut field = FormField::new(child.attr("var").unwrap_or_default());
                    field.type_ = child.attr("type").map(String::from);
                    field.label = child.attr("label").map(String::from);
                    for sub in child.children() {
                        match sub.name() {
                            "value" => field.values.push(sub.text()),
                            "required" => field.required = true,
                            "option" => {
                                if let Some(value) =
                                    sub.children().find(|c| c.name() == "value")
                                {
                                    field.options.push((
                                        sub.attr("label").map(String::from),
                                        value.text(),
                                    ));
                                }
                            }
                            _ => {}
                        }
                    }
                    form.fields.push(field);
                }
                _ => {}
            }
        }
        Ok(form)
    }

    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("x", ns::DATA_FORMS).attr("type", self.type_.as_str());

        if let Some(title) = &self.title {
            builder = builder.append(
                Element::builder("title", ns::DATA_FORMS)
                    .append(title.clone())
                    .build(),
            );
        }
        if let Some(instructions) = &self.instructions {
            builder = builder.append(
                Element::builder("instructions", ns::DATA_FORMS)
                    .append(instructions.clone())
                    .build(),
            );
        }

        for field in &self.fields {
            let mut field_builder = Element::builder("field", ns::DATA_FORMS);
            if !field.var.is_empty() {
                field_builder = field_builder.attr("var", field.var.clone());
            }
            if let Some(type_) = &field.type_ {
                field_builder = field_builder.attr("type", type_.clone());
            }
            if let Some(label) = &field.label {
                field_builder = field_builder.attr("label", label.clone());
            }
            if field.required {
                field_builder =
                    field_builder.append(Element::builder("required", ns::DATA_FORMS).build());
            }
            for value in &field.values {
                field_builder = field_builder.append(
                    Element::builder("value", ns::DATA_FORMS)
                        .append(value.clone())
                        .build(),
                );
            }
            builder = builder.append(field_builder.build());
        }

        builder.build()
    }

    pub fn field(&self, var: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.var == var)
    }

    pub fn set_value(&mut self, var: &str, value: impl Into<String>) {
        match self.fields.iter_mut().find(|f| f.var == var) {
            Some(field) => {
                field.values = vec![value.into()];
            }
            None => self.fields.push(FormField::with_value(var, value)),
        }
    }

    /// Turn a received form into a submission carrying the filled values.
    pub fn into_submit(mut self) -> DataForm {
        self.type_ = FormType::Submit;
        self.title = None;
        self.instructions = None;
        for field in &mut self.fields {
            field.label = None;
            field.options.clear();
            field.required = false;
        }
        self
    }

    /// Append the configured signature: the key verbatim and an HMAC-MD5
    /// over the concatenated `var=value` pairs, both as hidden fields.
    pub fn sign(&mut self, key: &str, secret: &str) -> Result<(), XmppError> {
        let mut mac = HmacMd5::new_from_slice(secret.as_bytes())
            .map_err(|_| XmppError::internal("form signature key setup failed"))?;
        for field in &self.fields {
            for value in &field.values {
                mac.update(field.var.as_bytes());
                mac.update(b"=");
                mac.update(value.as_bytes());
            }
        }
        let digest = mac.finalize().into_bytes();
        let hash: String = digest.iter().map(|b| format!("{:02x}", b)).collect();

        self.fields.push(FormField::hidden("signature-key", key));
        self.fields.push(FormField::hidden("signature-hash", hash));
        Ok(())
    }
}
