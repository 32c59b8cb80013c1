//! Transform & validate: opaque upstream payloads in, typed canonical
//! records out. Field mappings are configuration, not code: the built-ins
//! cover the goszakup v2 schema and `mappings.yaml` can override them.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use zakup_core::{AttrValue, CanonicalRecord, EntityKind, FieldKind, SkipReason};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub source: String,
    pub target: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            source: name.to_string(),
            target: name.to_string(),
            kind,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMapping {
    pub entity: EntityKind,
    pub natural_key_field: String,
    /// Secondary identifier tried when the primary is absent (participants
    /// carry `bin` or `iin`).
    #[serde(default)]
    pub fallback_natural_key_field: Option<String>,
    /// Field holding the parent's natural key; required when configured.
    #[serde(default)]
    pub dependency_key_field: Option<String>,
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct MappingFile {
    #[serde(default)]
    entities: Vec<EntityMapping>,
}

/// Per-entity mappings; built-ins overridable from YAML.
#[derive(Debug, Clone)]
pub struct MappingRegistry {
    map: HashMap<EntityKind, EntityMapping>,
}

impl MappingRegistry {
    pub fn builtin() -> Self {
        let map = EntityKind::DEPENDENCY_ORDER
            .iter()
            .map(|&entity| (entity, builtin_mapping(entity)))
            .collect();
        Self { map }
    }

    /// Built-ins with any entity present in the YAML file replaced wholesale.
    pub fn with_overrides_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: MappingFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let mut registry = Self::builtin();
        for mapping in file.entities {
            registry.map.insert(mapping.entity, mapping);
        }
        Ok(registry)
    }

    pub fn mapping(&self, entity: EntityKind) -> &EntityMapping {
        self.map
            .get(&entity)
            .expect("registry always holds every entity kind")
    }
}

fn text_field(name: &str) -> FieldSpec {
    FieldSpec::new(name, FieldKind::Text)
}

fn builtin_mapping(entity: EntityKind) -> EntityMapping {
    match entity {
        EntityKind::Procurement => EntityMapping {
            entity,
            natural_key_field: "id".to_string(),
            fallback_natural_key_field: None,
            dependency_key_field: None,
            fields: vec![
                text_field("number"),
                text_field("name_ru"),
                text_field("name_kz"),
                text_field("customer_bin"),
                text_field("customer_name_ru"),
                text_field("customer_name_kz"),
                FieldSpec::new("lots_count", FieldKind::Int),
                FieldSpec::new("application_start_date", FieldKind::Timestamp),
                FieldSpec::new("application_end_date", FieldKind::Timestamp),
                FieldSpec::new("publish_date", FieldKind::Timestamp),
                text_field("purchase_type_ru"),
                text_field("status_ru"),
                FieldSpec::new("total_sum", FieldKind::Decimal),
                text_field("location_ru"),
            ],
        },
        EntityKind::Lot => EntityMapping {
            entity,
            natural_key_field: "id".to_string(),
            fallback_natural_key_field: None,
            dependency_key_field: Some("trd_buy_id".to_string()),
            fields: vec![
                text_field("lot_number"),
                text_field("description_ru"),
                text_field("description_kz"),
                text_field("ktru_code"),
                text_field("ktru_name_ru"),
                text_field("unit_code"),
                text_field("unit_name_ru"),
                FieldSpec::new("quantity", FieldKind::Decimal),
                FieldSpec::new("price_per_unit", FieldKind::Decimal),
                FieldSpec::new("total_sum", FieldKind::Decimal),
                text_field("status_ru"),
                text_field("delivery_place_ru"),
                text_field("delivery_term"),
            ],
        },
        EntityKind::Contract => EntityMapping {
            entity,
            natural_key_field: "id".to_string(),
            fallback_natural_key_field: None,
            dependency_key_field: Some("lot_id".to_string()),
            fields: vec![
                text_field("contract_number"),
                text_field("description_ru"),
                FieldSpec::new("sum", FieldKind::Decimal),
                FieldSpec::new("supplier_sum", FieldKind::Decimal),
                text_field("customer_bin"),
                text_field("customer_name_ru"),
                text_field("supplier_bin"),
                text_field("supplier_name_ru"),
                FieldSpec::new("sign_date", FieldKind::Timestamp),
                FieldSpec::new("start_date", FieldKind::Timestamp),
                FieldSpec::new("end_date", FieldKind::Timestamp),
                text_field("status_ru"),
            ],
        },
        EntityKind::Participant => EntityMapping {
            entity,
            natural_key_field: "bin".to_string(),
            fallback_natural_key_field: Some("iin".to_string()),
            dependency_key_field: None,
            fields: vec![
                text_field("iin"),
                text_field("name_ru"),
                text_field("name_kz"),
                text_field("name_en"),
                text_field("email"),
                text_field("phone"),
                text_field("address_ru"),
                text_field("city_ru"),
                text_field("region_code"),
                FieldSpec::new("is_active", FieldKind::Bool),
                text_field("participant_type"),
                FieldSpec::new("registration_date", FieldKind::Timestamp),
                text_field("oked_code"),
            ],
        },
    }
}

/// Transform one raw payload. Deterministic: the only clock input is the
/// caller-supplied `synced_at` stamp.
pub fn transform(
    mapping: &EntityMapping,
    raw: &Value,
    synced_at: DateTime<Utc>,
) -> Result<CanonicalRecord, SkipReason> {
    let obj = raw.as_object().ok_or(SkipReason::NotObject)?;

    let natural_key = key_string(obj.get(&mapping.natural_key_field))
        .or_else(|| {
            mapping
                .fallback_natural_key_field
                .as_ref()
                .and_then(|f| key_string(obj.get(f)))
        })
        .ok_or(SkipReason::MissingNaturalKey)?;

    let dependency_key = match &mapping.dependency_key_field {
        Some(field) => Some(key_string(obj.get(field)).ok_or_else(|| {
            SkipReason::MissingField {
                field: field.clone(),
            }
        })?),
        None => None,
    };

    let mut attrs = BTreeMap::new();
    for spec in &mapping.fields {
        let value = obj.get(&spec.source).filter(|v| !v.is_null());
        match value {
            None if spec.required => {
                return Err(SkipReason::MissingField {
                    field: spec.source.clone(),
                })
            }
            None => continue,
            Some(value) => match coerce(value, spec.kind) {
                Some(attr) => {
                    attrs.insert(spec.target.clone(), attr);
                }
                None if spec.required => {
                    return Err(SkipReason::Coercion {
                        field: spec.source.clone(),
                        expected: spec.kind,
                    })
                }
                None => {
                    // Optional field with a bad shape: drop it field-wise.
                    debug!(entity = %mapping.entity, field = %spec.source, "uncoercible optional field dropped");
                }
            },
        }
    }

    Ok(CanonicalRecord {
        entity: mapping.entity,
        natural_key,
        dependency_key,
        attrs,
        synced_at,
    })
}

/// Transform a whole page with per-record isolation: malformed entries
/// become indexed skips, never a batch failure.
pub fn transform_batch(
    mapping: &EntityMapping,
    items: &[Value],
    synced_at: DateTime<Utc>,
) -> (Vec<CanonicalRecord>, Vec<(usize, SkipReason)>) {
    let mut records = Vec::with_capacity(items.len());
    let mut skips = Vec::new();
    for (idx, raw) in items.iter().enumerate() {
        match transform(mapping, raw, synced_at) {
            Ok(record) => records.push(record),
            Err(reason) => skips.push((idx, reason)),
        }
    }
    (records, skips)
}

/// Identifier fields arrive as numbers or strings upstream.
fn key_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn coerce(value: &Value, kind: FieldKind) -> Option<AttrValue> {
    match kind {
        FieldKind::Text => match value {
            Value::String(s) => Some(AttrValue::Text(s.clone())),
            Value::Number(n) => Some(AttrValue::Text(n.to_string())),
            _ => None,
        },
        FieldKind::Int => match value {
            Value::Number(n) => n.as_i64().map(AttrValue::Int),
            Value::String(s) => s.trim().parse().ok().map(AttrValue::Int),
            _ => None,
        },
        FieldKind::Decimal => match value {
            Value::Number(n) => n.as_f64().map(AttrValue::Decimal),
            Value::String(s) => s.trim().parse().ok().map(AttrValue::Decimal),
            _ => None,
        },
        FieldKind::Timestamp => value
            .as_str()
            .and_then(parse_datetime)
            .map(AttrValue::Timestamp),
        FieldKind::Bool => value.as_bool().map(AttrValue::Bool),
    }
}

/// Upstream emits several datetime shapes; fail closed on anything else.
fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
