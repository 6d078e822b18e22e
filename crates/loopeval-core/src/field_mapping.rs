use crate::model::{EvaluatorFieldMapping, FieldMapping, TargetFieldMapping};
use serde_json::Value;
use std::collections::BTreeMap;

pub type Fields = BTreeMap<String, Value>;

/// Resolves `a.b.0.c` against a field map; numeric segments index arrays.
pub fn lookup<'a>(fields: &'a Fields, path: &str) -> Option<&'a Value> {
    if let Some(v) = fields.get(path) {
        return Some(v);
    }
    let mut parts = path.split('.');
    let mut cur = fields.get(parts.next()?)?;
    for p in parts {
        cur = match cur {
            Value::Object(m) => m.get(p)?,
            Value::Array(a) => a.get(p.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn apply(mappings: &[FieldMapping], source: &Fields) -> Fields {
    let mut out = Fields::new();
    for m in mappings {
        let v = match (&m.const_value, &m.from_field_name) {
            (Some(c), _) => Some(c.clone()),
            (None, Some(from)) => lookup(source, from).cloned(),
            (None, None) => lookup(source, &m.field_name).cloned(),
        };
        if let Some(v) = v {
            out.insert(m.field_name.clone(), v);
        }
    }
    out
}

/// Target input for one turn; with no mapping every turn field passes through.
pub fn build_target_input(mapping: &TargetFieldMapping, turn: &Fields) -> Fields {
    if mapping.from_eval_set.is_empty() {
        return turn.clone();
    }
    apply(&mapping.from_eval_set, turn)
}

/// `(turn_input, target_output)` for an evaluator. Unmapped sides pass through.
pub fn build_evaluator_input(
    mapping: Option<&EvaluatorFieldMapping>,
    turn: &Fields,
    target_output: &Fields,
) -> (Fields, Fields) {
    match mapping {
        None => (turn.clone(), target_output.clone()),
        Some(m) => {
            let ti = if m.from_eval_set.is_empty() {
                turn.clone()
            } else {
                apply(&m.from_eval_set, turn)
            };
            let to = if m.from_target.is_empty() {
                target_output.clone()
            } else {
                apply(&m.from_target, target_output)
            };
            (ti, to)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Fields {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_passthrough_without_mapping() {
        let turn = fields(json!({"input": "hi", "reference": "hello"}));
        assert_eq!(build_target_input(&TargetFieldMapping::default(), &turn), turn);
    }

    #[test]
    fn test_renames_dotted_paths_and_consts() {
        let turn = fields(json!({"conv": {"messages": [{"text": "q1"}]}, "lang": "en"}));
        let mapping = TargetFieldMapping {
            from_eval_set: vec![
                FieldMapping {
                    field_name: "question".into(),
                    from_field_name: Some("conv.messages.0.text".into()),
                    const_value: None,
                },
                FieldMapping {
                    field_name: "style".into(),
                    from_field_name: None,
                    const_value: Some(json!("formal")),
                },
                FieldMapping {
                    field_name: "lang".into(),
                    from_field_name: None,
                    const_value: None,
                },
                FieldMapping {
                    field_name: "missing".into(),
                    from_field_name: Some("nope".into()),
                    const_value: None,
                },
            ],
        };
        let out = build_target_input(&mapping, &turn);
        assert_eq!(out, fields(json!({"question": "q1", "style": "formal", "lang": "en"})));
    }

    #[test]
    fn test_evaluator_sides_map_independently() {
        let turn = fields(json!({"input": "q", "reference_output": "4"}));
        let target = fields(json!({"actual_output": "four", "latency": 3}));
        let m = EvaluatorFieldMapping {
            evaluator_version_id: 7,
            from_eval_set: vec![],
            from_target: vec![FieldMapping {
                field_name: "output".into(),
                from_field_name: Some("actual_output".into()),
                const_value: None,
            }],
        };
        let (ti, to) = build_evaluator_input(Some(&m), &turn, &target);
        assert_eq!(ti, turn);
        assert_eq!(to, fields(json!({"output": "four"})));
    }
}
