use std::sync::Arc;
use juniper::{FieldError, ScalarValue, Value};

use crate::prelude::*;
use super::{AppError, AppErrors, Catalog, LangKey};


/// Maps internal field names to the names used in the API, as pairs
/// `(internal, public)`.
pub(crate) type FieldMap<'a> = &'a [(&'a str, &'a str)];

/// One error as it is sent to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TranslatedError {
    pub(crate) message: String,
    pub(crate) field: Option<String>,
    pub(crate) status: Option<u16>,
}

impl TranslatedError {
    /// Converts into a GraphQL error with `field` and `status` extensions.
    /// Absent values are left out of the extensions.
    pub(crate) fn into_field_error<S: ScalarValue>(self) -> FieldError<S> {
        let mut ext = juniper::Object::with_capacity(2);
        if let Some(field) = self.field {
            ext.add_field("field", Value::scalar(field));
        }
        if let Some(status) = self.status {
            ext.add_field("status", Value::scalar(i32::from(status)));
        }

        let ext = if ext.field_count() == 0 { Value::null() } else { Value::Object(ext) };
        FieldError::new(self.message, ext)
    }
}


/// Turns errors into [`TranslatedError`]s using the message catalog.
#[derive(Debug, Clone)]
pub(crate) struct Translator {
    catalog: Arc<Catalog>,
}

impl Translator {
    pub(crate) fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// Translates `err` into one entry per contained application error. An
    /// error that is neither `AppError` nor `AppErrors` results in a single
    /// entry without metadata, using its string representation as key.
    pub(crate) fn translate(
        &self,
        err: &anyhow::Error,
        lang: LangKey,
        field_map: FieldMap<'_>,
    ) -> Vec<TranslatedError> {
        if let Some(errs) = err.downcast_ref::<AppErrors>() {
            errs.iter().map(|e| self.translate_app_error(e, lang, field_map)).collect()
        } else if let Some(e) = err.downcast_ref::<AppError>() {
            vec![self.translate_app_error(e, lang, field_map)]
        } else {
            error!("Unexpected error reached the API: {err:#}");
            vec![TranslatedError {
                message: self.catalog.message(lang, &err.to_string()).to_owned(),
                field: None,
                status: None,
            }]
        }
    }

    fn translate_app_error(
        &self,
        err: &AppError,
        lang: LangKey,
        field_map: FieldMap<'_>,
    ) -> TranslatedError {
        if let Some(source) = &err.source {
            if err.status.map_or(true, |s| s >= 500) {
                error!("{}: {source:#}", err.key);
            } else {
                debug!("{}: {source:#}", err.key);
            }
        }

        let field = err.field
            .filter(|f| !f.trim().is_empty())
            .map(|f| {
                field_map.iter()
                    .find(|(internal, _)| *internal == f)
                    .map_or(f, |(_, public)| *public)
                    .to_owned()
            });

        TranslatedError {
            message: self.catalog.message(lang, err.key).to_owned(),
            field,
            status: err.status,
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use juniper::{DefaultScalarValue, FieldError, graphql_value};

    use crate::prelude::*;
    use super::{TranslatedError, Translator};
    use crate::apperr::{AppError, AppErrors, Catalog, LangKey, catalog::DEFAULT_MESSAGE};

    fn translator() -> Translator {
        let catalog = Catalog::from_json(r#"{
            "default": {
                "errorInternal": "Something broke.",
                "errorTitle": "Bad title.",
                "errorContent": "Bad content."
            },
            "de": { "errorTitle": "Schlechter Titel." }
        }"#).unwrap();
        Translator::new(Arc::new(catalog))
    }

    #[test]
    fn app_error_is_looked_up() {
        let err = anyhow::Error::from(AppError::internal("errorInternal", anyhow!("db down")));
        let out = translator().translate(&err, LangKey::Default, &[]);
        assert_eq!(out, vec![TranslatedError {
            message: "Something broke.".into(),
            field: None,
            status: Some(500),
        }]);
    }

    #[test]
    fn unknown_key_is_not_leaked() {
        let err = anyhow::Error::from(AppError::internal("errorNotInCatalog", anyhow!("x")));
        let out = translator().translate(&err, LangKey::De, &[]);
        assert_eq!(out[0].message, DEFAULT_MESSAGE);
        assert!(!out[0].message.contains("errorNotInCatalog"));
    }

    #[test]
    fn foreign_error_has_no_metadata() {
        let err = anyhow!("relation \"notes\" does not exist");
        let out = translator().translate(&err, LangKey::Default, &[]);
        assert_eq!(out, vec![TranslatedError {
            message: DEFAULT_MESSAGE.into(),
            field: None,
            status: None,
        }]);
    }

    #[test]
    fn multiple_errors_are_flattened_and_fields_mapped() {
        let errs = AppErrors(vec![
            AppError::for_field("errorTitle", "title", 400),
            AppError::for_field("errorContent", "content", 400),
        ]);
        let err = anyhow::Error::from(errs).context("validating note");
        let out = translator().translate(&err, LangKey::De, &[("title", "input.title")]);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message, "Schlechter Titel.");
        assert_eq!(out[0].field.as_deref(), Some("input.title"));
        assert_eq!(out[1].message, "Bad content.");
        assert_eq!(out[1].field.as_deref(), Some("content"));
    }

    #[test]
    fn blank_field_is_dropped() {
        let err = anyhow::Error::from(AppError::for_field("errorTitle", "  ", 400));
        let out = translator().translate(&err, LangKey::Default, &[]);
        assert_eq!(out[0].field, None);
    }

    #[test]
    fn extensions() {
        let full: FieldError<DefaultScalarValue> = TranslatedError {
            message: "Bad title.".into(),
            field: Some("title".into()),
            status: Some(400),
        }.into_field_error();
        assert_eq!(full.message(), "Bad title.");
        assert_eq!(full.extensions(), &graphql_value!({ "field": "title", "status": 400 }));

        let bare: FieldError<DefaultScalarValue> = TranslatedError {
            message: DEFAULT_MESSAGE.into(),
            field: None,
            status: None,
        }.into_field_error();
        assert!(bare.extensions().is_null());
    }
}
