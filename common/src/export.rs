use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::error::OperationError;
use crate::record::{ParsedRecord, RawFields, RecordOutcome};
use crate::requests::ExportFormat;

const FIXED_COLUMNS: &[&str] = &[
    "record_index",
    "status",
    "created_farmer_id",
    "error_kind",
    "error_detail",
    "attempts",
];

#[derive(Serialize)]
struct ExportRow<'a> {
    #[serde(flatten)]
    outcome: &'a RecordOutcome,
    input: Option<&'a RawFields>,
}

/// Exporta los resultados ordenados por índice. Sin `include_all` sólo salen
/// los fallidos. Cada fila lleva los campos enviados originalmente, para
/// poder corregirlos y volver a subirlos.
pub fn export_outcomes(
    outcomes: &[RecordOutcome],
    input: &[ParsedRecord],
    format: ExportFormat,
    include_all: bool,
) -> Result<Vec<u8>, OperationError> {
    let mut selected: Vec<&RecordOutcome> = outcomes
        .iter()
        .filter(|o| include_all || !o.is_success())
        .collect();
    selected.sort_by_key(|o| o.record_index);

    let fields_by_index: HashMap<usize, &RawFields> =
        input.iter().map(|r| (r.index, &r.fields)).collect();

    match format {
        ExportFormat::Json => {
            let rows: Vec<ExportRow<'_>> = selected
                .iter()
                .map(|o| ExportRow {
                    outcome: o,
                    input: fields_by_index.get(&o.record_index).copied(),
                })
                .collect();
            serde_json::to_vec_pretty(&rows).map_err(|e| OperationError::Export(e.to_string()))
        }
        ExportFormat::Csv => to_csv(&selected, &fields_by_index),
    }
}

fn to_csv(
    selected: &[&RecordOutcome],
    fields_by_index: &HashMap<usize, &RawFields>,
) -> Result<Vec<u8>, OperationError> {
    // columnas de entrada: unión de los campos de las filas exportadas
    let input_columns: BTreeSet<&str> = selected
        .iter()
        .filter_map(|o| fields_by_index.get(&o.record_index))
        .flat_map(|fields| fields.keys().map(String::as_str))
        .filter(|k| !FIXED_COLUMNS.contains(k))
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    let export_err = |e: csv::Error| OperationError::Export(e.to_string());

    let header: Vec<&str> = FIXED_COLUMNS
        .iter()
        .copied()
        .chain(input_columns.iter().copied())
        .collect();
    writer.write_record(&header).map_err(export_err)?;

    for o in selected {
        let mut row: Vec<String> = vec![
            o.record_index.to_string(),
            if o.is_success() { "SUCCESS" } else { "FAILED" }.to_string(),
            o.created_farmer_id.clone().unwrap_or_default(),
            o.error_kind.map(|k| k.as_str().to_string()).unwrap_or_default(),
            o.error_detail.clone().unwrap_or_default(),
            o.attempts.to_string(),
        ];
        let fields = fields_by_index.get(&o.record_index);
        for col in &input_columns {
            row.push(
                fields
                    .and_then(|f| f.get(*col))
                    .cloned()
                    .unwrap_or_default(),
            );
        }
        writer.write_record(&row).map_err(export_err)?;
    }

    writer
        .into_inner()
        .map_err(|e| OperationError::Export(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ErrorKind;
    use serde_json::Value;

    fn input() -> Vec<ParsedRecord> {
        (0..3)
            .map(|i| ParsedRecord {
                index: i,
                fields: [
                    ("first_name".to_string(), format!("F{i}")),
                    ("phone_number".to_string(), format!("98765432{i}0")),
                ]
                .into_iter()
                .collect(),
            })
            .collect()
    }

    fn outcomes() -> Vec<RecordOutcome> {
        vec![
            RecordOutcome::failure(2, ErrorKind::Permanent, "duplicado", 1),
            RecordOutcome::success(0, "farmer-0".into(), 1),
            RecordOutcome::failure(1, ErrorKind::Validation, "phone_number: formato inválido", 0),
        ]
    }

    #[test]
    fn csv_sin_include_all_solo_trae_fallidos_ordenados() {
        let bytes = export_outcomes(&outcomes(), &input(), ExportFormat::Csv, false).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "record_index,status,created_farmer_id,error_kind,error_detail,attempts,first_name,phone_number"
        );
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("1,FAILED,,VALIDATION_ERROR,"));
        assert!(lines[1].ends_with(",F1,9876543210"));
        assert!(lines[2].starts_with("2,FAILED,,PERMANENT_ERROR,duplicado,1,F2"));
    }

    #[test]
    fn json_con_include_all_trae_todo_con_entrada() {
        let bytes = export_outcomes(&outcomes(), &input(), ExportFormat::Json, true).unwrap();
        let rows: Vec<Value> = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["record_index"], 0);
        assert_eq!(rows[0]["status"], "SUCCESS");
        assert_eq!(rows[0]["created_farmer_id"], "farmer-0");
        assert_eq!(rows[1]["error_kind"], "VALIDATION_ERROR");
        assert_eq!(rows[2]["input"]["first_name"], "F2");
    }
}
