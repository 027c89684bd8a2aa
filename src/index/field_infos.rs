//! Per-segment field schema, learned from the documents as they arrive.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::document::{Field, FieldValue, IndexOptions};
use crate::error::{IrisError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocValuesType {
    Numeric,
    Binary,
}

/// What a segment knows about one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    /// Assigned in first-seen order.
    pub number: u32,
    pub index_options: Option<IndexOptions>,
    pub omit_norms: bool,
    pub doc_values: Option<DocValuesType>,
}

impl FieldInfo {
    pub fn is_indexed(&self) -> bool {
        self.index_options.is_some()
    }

    pub fn has_norms(&self) -> bool {
        self.is_indexed() && !self.omit_norms
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldInfos {
    by_name: AHashMap<String, usize>,
    infos: Vec<FieldInfo>,
}

impl FieldInfos {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name.get(name).map(|&i| &self.infos[i])
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.infos.iter()
    }

    /// Check that `field` agrees with what is already known, without changing
    /// anything.
    pub fn check(&self, field: &Field) -> Result<()> {
        let Some(info) = self.get(&field.name) else {
            return Ok(());
        };
        if field.is_indexed() {
            if let Some(existing) = info.index_options {
                if existing != field.index_options {
                    return Err(IrisError::invalid_argument(format!(
                        "cannot change index options from {existing:?} to {:?} for field \"{}\"",
                        field.index_options, field.name
                    )));
                }
            }
        }
        if let (Some(existing), Some(incoming)) = (info.doc_values, doc_values_type(field)) {
            if existing != incoming {
                return Err(IrisError::invalid_argument(format!(
                    "cannot change doc values type from {existing:?} to {incoming:?} for field \"{}\"",
                    field.name
                )));
            }
        }
        Ok(())
    }

    /// Merge `field` into the schema and return its field number.
    pub fn add(&mut self, field: &Field) -> Result<u32> {
        self.check(field)?;
        let index = match self.by_name.get(&field.name) {
            Some(&i) => i,
            None => {
                let number = self.infos.len() as u32;
                self.infos.push(FieldInfo {
                    name: field.name.clone(),
                    number,
                    index_options: None,
                    omit_norms: false,
                    doc_values: None,
                });
                self.by_name.insert(field.name.clone(), self.infos.len() - 1);
                self.infos.len() - 1
            }
        };

        let info = &mut self.infos[index];
        if field.is_indexed() {
            if info.index_options.is_none() {
                info.omit_norms = field.omit_norms;
            } else {
                // once omitted, norms stay omitted for the segment
                info.omit_norms |= field.omit_norms;
            }
            info.index_options = Some(field.index_options);
        }
        if let Some(kind) = doc_values_type(field) {
            info.doc_values = Some(kind);
        }
        Ok(info.number)
    }
}

fn doc_values_type(field: &Field) -> Option<DocValuesType> {
    match field.value {
        FieldValue::Numeric(_) => Some(DocValuesType::Numeric),
        FieldValue::Binary(_) => Some(DocValuesType::Binary),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_in_first_seen_order() {
        let mut infos = FieldInfos::new();
        assert_eq!(infos.add(&Field::tokens("body", ["a"])).unwrap(), 0);
        assert_eq!(infos.add(&Field::numeric_doc_value("rank", 1)).unwrap(), 1);
        assert_eq!(infos.add(&Field::tokens("body", ["b"])).unwrap(), 0);
        assert_eq!(infos.len(), 2);
        assert!(infos.get("body").unwrap().has_norms());
        assert_eq!(
            infos.get("rank").unwrap().doc_values,
            Some(DocValuesType::Numeric)
        );
    }

    #[test]
    fn test_conflicts_are_rejected() {
        let mut infos = FieldInfos::new();
        infos.add(&Field::numeric_doc_value("rank", 1)).unwrap();
        assert!(infos.add(&Field::binary_doc_value("rank", vec![1])).is_err());

        infos.add(&Field::tokens("body", ["a"])).unwrap();
        let docs_only = Field::tokens("body", ["a"]).with_index_options(IndexOptions::Docs);
        assert!(matches!(
            infos.check(&docs_only),
            Err(IrisError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_omit_norms_is_sticky() {
        let mut infos = FieldInfos::new();
        infos.add(&Field::tokens("body", ["a"]).omit_norms()).unwrap();
        infos.add(&Field::tokens("body", ["b"])).unwrap();
        assert!(!infos.get("body").unwrap().has_norms());
    }
}
