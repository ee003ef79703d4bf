//! Field mapping
//!
//! Exactly one mapping style is chosen when the destination is built:
//!
//! - legacy string rules `"/src -> /dst"` (move) and `"/src -> "` (remove),
//!   with `default` (keep unmapped fields) or `strict` (mapped fields only)
//! - structured rules with `move`, `remove`, `cast` and `constant` actions
//!
//! Configuring both styles is rejected.

use super::path::FieldPath;
use super::RuleError;
use crate::config::{DataLayout, LegacyMappingType, MappingAction, MappingRuleConfig};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const LEGACY_SEPARATOR: &str = "->";

#[derive(Debug, Clone, PartialEq)]
pub struct LegacyRule {
    src: FieldPath,
    /// None removes the source field
    dst: Option<FieldPath>,
}

impl LegacyRule {
    pub fn parse(raw: &str) -> Result<Self, RuleError> {
        let invalid = |reason: &str| RuleError::Mapping(format!("malformed mapping rule '{}': {}", raw, reason));

        let (src, dst) = raw
            .split_once(LEGACY_SEPARATOR)
            .ok_or_else(|| invalid("expected '<src> -> <dst>'"))?;
        let src = FieldPath::parse(src).ok_or_else(|| invalid("source must be a path starting with /"))?;
        let dst = match dst.trim() {
            "" => None,
            dst => Some(FieldPath::parse(dst).ok_or_else(|| invalid("destination must be a path starting with /"))?),
        };
        Ok(LegacyRule { src, dst })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredRule {
    action: MappingAction,
    src: Option<FieldPath>,
    dst: Option<FieldPath>,
    sql_type: Option<String>,
    value: Option<Value>,
}

impl StructuredRule {
    pub fn from_config(config: &MappingRuleConfig) -> Result<Self, RuleError> {
        let invalid = |reason: &str| RuleError::Mapping(format!("malformed mapping rule [{}]: {}", config, reason));
        let path = |raw: &Option<String>, field: &str| -> Result<Option<FieldPath>, RuleError> {
            match raw.as_deref().map(str::trim) {
                None | Some("") => Ok(None),
                Some(raw) => FieldPath::parse(raw)
                    .map(Some)
                    .ok_or_else(|| invalid(&format!("{} must be a path starting with /", field))),
            }
        };

        let src = path(&config.src, "src")?;
        let dst = path(&config.dst, "dst")?;

        match config.action {
            MappingAction::Move if src.is_none() || dst.is_none() => {
                return Err(invalid("move requires src and dst"))
            }
            MappingAction::Remove if src.is_none() => return Err(invalid("remove requires src")),
            MappingAction::Cast if dst.is_none() => return Err(invalid("cast requires dst")),
            MappingAction::Constant if dst.is_none() || config.value.is_none() => {
                return Err(invalid("constant requires dst and value"))
            }
            _ => {}
        }
        if config.sql_type.is_some() && dst.is_none() {
            return Err(invalid("type requires dst"));
        }

        Ok(StructuredRule {
            action: config.action,
            src,
            dst,
            sql_type: config.sql_type.clone(),
            value: config.value.clone(),
        })
    }
}

/// The mapping strategy of one destination
#[derive(Debug, Clone, PartialEq)]
pub enum FieldMapper {
    /// No mapping configured
    Passthrough,
    Legacy {
        mapping_type: LegacyMappingType,
        rules: Vec<LegacyRule>,
    },
    Structured {
        keep_unmapped: bool,
        rules: Vec<StructuredRule>,
    },
}

impl FieldMapper {
    /// Build from a data layout. Also returns SQL type casts keyed by the
    /// flattened destination column.
    pub fn from_layout(
        layout: Option<&DataLayout>,
    ) -> Result<(Self, BTreeMap<String, String>), RuleError> {
        let Some(layout) = layout else {
            return Ok((FieldMapper::Passthrough, BTreeMap::new()));
        };

        // A `mappings` block selects the structured style even without rules
        match (layout.mapping.is_empty(), layout.mappings.as_ref()) {
            (false, Some(_)) => Err(RuleError::Mapping(
                "both 'mapping' and 'mappings' are configured; use only one".to_string(),
            )),
            (_, Some(mappings)) => {
                let rules = mappings
                    .fields
                    .iter()
                    .map(StructuredRule::from_config)
                    .collect::<Result<Vec<_>, _>>()?;
                let casts = rules
                    .iter()
                    .filter_map(|r| Some((r.dst.as_ref()?.flattened(), r.sql_type.clone()?)))
                    .collect();
                Ok((
                    FieldMapper::Structured {
                        keep_unmapped: mappings.keep_unmapped.unwrap_or(true),
                        rules,
                    },
                    casts,
                ))
            }
            (false, None) => {
                let rules = layout
                    .mapping
                    .iter()
                    .map(|r| LegacyRule::parse(r))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((
                    FieldMapper::Legacy {
                        mapping_type: layout.mapping_type.unwrap_or_default(),
                        rules,
                    },
                    BTreeMap::new(),
                ))
            }
            (true, None) => Ok((FieldMapper::Passthrough, BTreeMap::new())),
        }
    }

    /// Human-readable mode for startup logs
    pub fn mode_description(&self) -> &'static str {
        match self {
            FieldMapper::Passthrough => "passthrough",
            FieldMapper::Legacy {
                mapping_type: LegacyMappingType::Strict,
                ..
            } => "strict",
            FieldMapper::Legacy { .. } => "default",
            FieldMapper::Structured {
                keep_unmapped: true,
                ..
            } => "keep unmapped fields",
            FieldMapper::Structured { .. } => "remove unmapped fields",
        }
    }

    pub fn map(&self, event: &Map<String, Value>) -> Result<Map<String, Value>, String> {
        match self {
            FieldMapper::Passthrough => Ok(event.clone()),
            FieldMapper::Legacy { mapping_type, rules } => map_legacy(*mapping_type, rules, event),
            FieldMapper::Structured {
                keep_unmapped,
                rules,
            } => map_structured(*keep_unmapped, rules, event),
        }
    }
}

fn map_legacy(
    mapping_type: LegacyMappingType,
    rules: &[LegacyRule],
    event: &Map<String, Value>,
) -> Result<Map<String, Value>, String> {
    match mapping_type {
        LegacyMappingType::Default => {
            let mut mapped = event.clone();
            for rule in rules {
                let value = rule.src.remove(&mut mapped);
                if let (Some(dst), Some(value)) = (&rule.dst, value) {
                    dst.set(&mut mapped, value)?;
                }
            }
            Ok(mapped)
        }
        LegacyMappingType::Strict => {
            let mut mapped = Map::new();
            for rule in rules {
                if let (Some(dst), Some(value)) = (&rule.dst, rule.src.get(event)) {
                    dst.set(&mut mapped, value.clone())?;
                }
            }
            Ok(mapped)
        }
    }
}

fn map_structured(
    keep_unmapped: bool,
    rules: &[StructuredRule],
    event: &Map<String, Value>,
) -> Result<Map<String, Value>, String> {
    let mut mapped = if keep_unmapped {
        event.clone()
    } else {
        Map::new()
    };

    for rule in rules {
        match rule.action {
            MappingAction::Move => {
                let (Some(src), Some(dst)) = (&rule.src, &rule.dst) else {
                    continue;
                };
                let value = if keep_unmapped {
                    src.remove(&mut mapped)
                } else {
                    src.get(event).cloned()
                };
                if let Some(value) = value {
                    dst.set(&mut mapped, value)?;
                }
            }
            MappingAction::Remove => {
                if let Some(src) = &rule.src {
                    src.remove(&mut mapped);
                }
            }
            MappingAction::Cast => {
                let Some(dst) = &rule.dst else {
                    continue;
                };
                let src = rule.src.as_ref().unwrap_or(dst);
                if keep_unmapped && src == dst {
                    continue;
                }
                if let Some(value) = src.get(event).cloned() {
                    if keep_unmapped {
                        src.remove(&mut mapped);
                    }
                    dst.set(&mut mapped, value)?;
                }
            }
            MappingAction::Constant => {
                if let (Some(dst), Some(value)) = (&rule.dst, &rule.value) {
                    dst.set(&mut mapped, value.clone())?;
                }
            }
        }
    }
    Ok(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StructuredMappingConfig;
    use serde_json::json;

    fn event(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn rule(action: MappingAction, src: Option<&str>, dst: Option<&str>) -> MappingRuleConfig {
        MappingRuleConfig {
            src: src.map(str::to_string),
            dst: dst.map(str::to_string),
            action,
            sql_type: None,
            value: None,
        }
    }

    fn legacy(mapping_type: Option<LegacyMappingType>, rules: &[&str]) -> DataLayout {
        DataLayout {
            mapping_type,
            mapping: rules.iter().map(|r| r.to_string()).collect(),
            ..DataLayout::default()
        }
    }

    fn structured(keep_unmapped: Option<bool>, fields: Vec<MappingRuleConfig>) -> DataLayout {
        DataLayout {
            mappings: Some(StructuredMappingConfig {
                keep_unmapped,
                fields,
            }),
            ..DataLayout::default()
        }
    }

    #[test]
    fn test_passthrough() {
        let (mapper, casts) = FieldMapper::from_layout(None).unwrap();
        assert_eq!(mapper, FieldMapper::Passthrough);
        assert!(casts.is_empty());

        let (mapper, _) = FieldMapper::from_layout(Some(&DataLayout::default())).unwrap();
        assert_eq!(mapper, FieldMapper::Passthrough);
        let e = event(json!({"a": 1}));
        assert_eq!(mapper.map(&e).unwrap(), e);
    }

    #[test]
    fn test_legacy_default_moves_and_removes() {
        let layout = legacy(None, &["/a/b -> /c", "/secret -> "]);
        let (mapper, _) = FieldMapper::from_layout(Some(&layout)).unwrap();
        assert_eq!(mapper.mode_description(), "default");

        let mapped = mapper
            .map(&event(json!({"a": {"b": 1, "x": 2}, "secret": "s", "keep": true})))
            .unwrap();
        assert_eq!(mapped, event(json!({"a": {"x": 2}, "c": 1, "keep": true})));
    }

    #[test]
    fn test_legacy_strict_keeps_only_mapped() {
        let layout = legacy(Some(LegacyMappingType::Strict), &["/a -> /b/c"]);
        let (mapper, _) = FieldMapper::from_layout(Some(&layout)).unwrap();
        let mapped = mapper.map(&event(json!({"a": 1, "other": 2}))).unwrap();
        assert_eq!(mapped, event(json!({"b": {"c": 1}})));
    }

    #[test]
    fn test_legacy_malformed_rule() {
        for bad in ["/a /b", "a -> /b", "/a -> b"] {
            let layout = legacy(None, &[bad]);
            assert!(matches!(
                FieldMapper::from_layout(Some(&layout)),
                Err(RuleError::Mapping(_))
            ));
        }
    }

    #[test]
    fn test_structured_keep_unmapped() {
        let mut constant = rule(MappingAction::Constant, None, Some("/source"));
        constant.value = Some(json!("web"));
        let mut cast = rule(MappingAction::Cast, None, Some("/amount"));
        cast.sql_type = Some("numeric(10,2)".to_string());
        let mut typed_move = rule(MappingAction::Move, Some("/user/id"), Some("/user_id"));
        typed_move.sql_type = Some("text".to_string());

        let layout = structured(
            None,
            vec![typed_move, rule(MappingAction::Remove, Some("/debug"), None), cast, constant],
        );
        let (mapper, casts) = FieldMapper::from_layout(Some(&layout)).unwrap();
        assert_eq!(mapper.mode_description(), "keep unmapped fields");
        assert_eq!(casts.get("user_id").map(String::as_str), Some("text"));
        assert_eq!(casts.get("amount").map(String::as_str), Some("numeric(10,2)"));

        let mapped = mapper
            .map(&event(json!({"user": {"id": 7}, "debug": 1, "amount": 3.5, "x": "y"})))
            .unwrap();
        assert_eq!(
            mapped,
            event(json!({"user": {}, "user_id": 7, "amount": 3.5, "x": "y", "source": "web"}))
        );
    }

    #[test]
    fn test_structured_remove_unmapped() {
        let layout = structured(
            Some(false),
            vec![
                rule(MappingAction::Move, Some("/a"), Some("/b")),
                rule(MappingAction::Cast, None, Some("/n")),
            ],
        );
        let (mapper, _) = FieldMapper::from_layout(Some(&layout)).unwrap();
        assert_eq!(mapper.mode_description(), "remove unmapped fields");
        let mapped = mapper.map(&event(json!({"a": 1, "n": 2, "z": 3}))).unwrap();
        assert_eq!(mapped, event(json!({"b": 1, "n": 2})));
    }

    #[test]
    fn test_empty_structured_block_counts_as_structured() {
        let mut layout = legacy(None, &["/a -> /b"]);
        layout.mappings = Some(StructuredMappingConfig {
            keep_unmapped: Some(false),
            fields: vec![],
        });
        assert!(matches!(
            FieldMapper::from_layout(Some(&layout)),
            Err(RuleError::Mapping(_))
        ));

        layout.mapping.clear();
        let (mapper, casts) = FieldMapper::from_layout(Some(&layout)).unwrap();
        assert_eq!(mapper.mode_description(), "remove unmapped fields");
        assert!(casts.is_empty());
        assert_eq!(mapper.map(&event(json!({"a": 1}))).unwrap(), event(json!({})));
    }

    #[test]
    fn test_both_styles_rejected() {
        let mut layout = legacy(None, &["/a -> /b"]);
        layout.mappings = Some(StructuredMappingConfig {
            keep_unmapped: None,
            fields: vec![rule(MappingAction::Remove, Some("/x"), None)],
        });
        let err = FieldMapper::from_layout(Some(&layout)).unwrap_err();
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn test_structured_rule_validation() {
        let bad = [
            rule(MappingAction::Move, Some("/a"), None),
            rule(MappingAction::Remove, None, None),
            rule(MappingAction::Cast, Some("/a"), None),
            rule(MappingAction::Constant, None, Some("/a")),
            rule(MappingAction::Move, Some("a"), Some("/b")),
        ];
        for config in &bad {
            assert!(StructuredRule::from_config(config).is_err(), "{}", config);
        }
    }

    #[test]
    fn test_move_into_scalar_parent_fails() {
        let layout = legacy(None, &["/a -> /b/c"]);
        let (mapper, _) = FieldMapper::from_layout(Some(&layout)).unwrap();
        assert!(mapper.map(&event(json!({"a": 1, "b": "scalar"}))).is_err());
    }
}
