use serde_json::Value;

use crate::error::FormatError;
use crate::operation::InputFormat;
use crate::record::{ParsedRecord, RawFields};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Nombres alternativos que aparecen en las plantillas de las FPO.
const FIELD_ALIASES: &[(&str, &str)] = &[
    ("firstname", "first_name"),
    ("lastname", "last_name"),
    ("surname", "last_name"),
    ("phone", "phone_number"),
    ("mobile", "phone_number"),
    ("mobile_number", "phone_number"),
    ("mobile_no", "phone_number"),
    ("contact_number", "phone_number"),
    ("aadhaar", "aadhaar_number"),
    ("aadhar", "aadhaar_number"),
    ("aadhar_number", "aadhaar_number"),
    ("dob", "date_of_birth"),
    ("pin", "pincode"),
    ("pin_code", "pincode"),
    ("land_area", "land_acres"),
    ("land_size", "land_acres"),
    ("total_land_acres", "land_acres"),
    ("experience", "experience_years"),
    ("farming_experience", "experience_years"),
];

/// Normaliza un nombre de columna: sin BOM, recortado, en minúscula,
/// con espacios y guiones convertidos a '_' y alias resueltos.
pub fn normalize_field_name(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .trim_start_matches('\u{feff}')
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect();

    FIELD_ALIASES
        .iter()
        .find(|(alias, _)| *alias == cleaned)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(cleaned)
}

/// Secuencia perezosa de registros parseados, en el orden de la entrada.
pub struct Records<'a> {
    inner: Inner<'a>,
    next_index: usize,
}

enum Inner<'a> {
    Delimited {
        headers: Vec<String>,
        rows: csv::StringRecordsIntoIter<&'a [u8]>,
    },
    Json(std::vec::IntoIter<Value>),
    JsonLines(std::iter::Enumerate<std::str::Lines<'a>>),
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<ParsedRecord, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        let fields = match &mut self.inner {
            Inner::Delimited { headers, rows } => loop {
                let row = match rows.next()? {
                    Ok(row) => row,
                    Err(e) => return Some(Err(csv_error(e))),
                };
                // filas completamente vacías se ignoran (",,,")
                if row.iter().all(|v| v.trim().is_empty()) {
                    continue;
                }
                let mut fields = RawFields::new();
                for (idx, h) in headers.iter().enumerate() {
                    if h.is_empty() {
                        continue;
                    }
                    let val = row.get(idx).unwrap_or("").trim_start_matches('\u{feff}');
                    fields.insert(h.clone(), val.trim().to_string());
                }
                break fields;
            },
            Inner::Json(items) => {
                let item = items.next()?;
                match object_to_fields(item) {
                    Some(fields) => fields,
                    None => {
                        return Some(Err(FormatError::NotAnObject {
                            index: self.next_index,
                        }))
                    }
                }
            }
            Inner::JsonLines(lines) => loop {
                let (line_no, line) = lines.next()?;
                if line.trim().is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(e) => {
                        return Some(Err(FormatError::Json(format!(
                            "línea {}: {e}",
                            line_no + 1
                        ))))
                    }
                };
                match object_to_fields(value) {
                    Some(fields) => break fields,
                    None => {
                        return Some(Err(FormatError::NotAnObject {
                            index: self.next_index,
                        }))
                    }
                }
            },
        };

        let record = ParsedRecord {
            index: self.next_index,
            fields,
        };
        self.next_index += 1;
        Some(Ok(record))
    }
}

/// Abre la entrada según el formato declarado y devuelve el iterador perezoso.
/// Falla sólo si la estructura general no se puede leer (encabezados, UTF-8, JSON).
pub fn records(data: &[u8], format: InputFormat) -> Result<Records<'_>, FormatError> {
    let data = data.strip_prefix(UTF8_BOM).unwrap_or(data);
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(FormatError::Empty);
    }

    let inner = match format {
        InputFormat::DelimitedText => delimited(data, detect_delimiter(data))?,
        InputFormat::Spreadsheet => delimited(data, b'\t')?,
        InputFormat::StructuredJson => structured(data)?,
    };

    Ok(Records {
        inner,
        next_index: 0,
    })
}

/// Parsea toda la entrada. El total queda fijo a partir de aquí.
pub fn parse_all(
    data: &[u8],
    format: InputFormat,
    max_records: usize,
) -> Result<Vec<ParsedRecord>, FormatError> {
    let mut out = Vec::new();
    let mut found = 0usize;

    for rec in records(data, format)? {
        let rec = rec?;
        found += 1;
        if found <= max_records {
            out.push(rec);
        }
    }

    if found > max_records {
        return Err(FormatError::TooManyRecords {
            found,
            max: max_records,
        });
    }
    if out.is_empty() {
        return Err(FormatError::NoRecords);
    }

    Ok(out)
}

/// Texto delimitado: coma por defecto; punto y coma si el encabezado lo usa
/// (exportaciones de Excel con configuración regional europea).
fn detect_delimiter(data: &[u8]) -> u8 {
    let header = data.split(|b| *b == b'\n').next().unwrap_or(&[]);
    let commas = header.iter().filter(|b| **b == b',').count();
    let semicolons = header.iter().filter(|b| **b == b';').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

fn delimited(data: &[u8], delimiter: u8) -> Result<Inner<'_>, FormatError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .has_headers(true)
        .from_reader(data);

    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_error)?
        .iter()
        .map(normalize_field_name)
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(FormatError::MissingHeader);
    }

    Ok(Inner::Delimited {
        headers,
        rows: reader.into_records(),
    })
}

fn structured(data: &[u8]) -> Result<Inner<'_>, FormatError> {
    match serde_json::from_slice::<Value>(data) {
        Ok(Value::Array(items)) => Ok(Inner::Json(items.into_iter())),
        Ok(Value::Object(mut obj)) => match obj.remove("farmers") {
            Some(Value::Array(items)) => Ok(Inner::Json(items.into_iter())),
            Some(_) => Err(FormatError::Json(
                "el campo \"farmers\" debe ser un arreglo".to_string(),
            )),
            None => Ok(Inner::Json(vec![Value::Object(obj)].into_iter())),
        },
        Ok(_) => Err(FormatError::Json(
            "se esperaba un arreglo u objeto JSON".to_string(),
        )),
        Err(_) => {
            // no es un documento único: probamos JSON Lines
            let text = std::str::from_utf8(data).map_err(|_| FormatError::NotUtf8)?;
            Ok(Inner::JsonLines(text.lines().enumerate()))
        }
    }
}

fn object_to_fields(value: Value) -> Option<RawFields> {
    let Value::Object(obj) = value else {
        return None;
    };

    let mut fields = RawFields::new();
    for (key, val) in obj {
        let rendered = match val {
            Value::Null => continue,
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => other.to_string(),
        };
        fields.insert(normalize_field_name(&key), rendered);
    }
    Some(fields)
}

fn csv_error(e: csv::Error) -> FormatError {
    let line = e.position().map(|p| p.line()).unwrap_or(0);
    match e.kind() {
        csv::ErrorKind::Utf8 { .. } => FormatError::NotUtf8,
        _ => FormatError::Delimited {
            line,
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 10_000;

    #[test]
    fn csv_lee_encabezados_y_valores() {
        let data = b"first_name,last_name,phone_number\nAna,Rao,9876543210\nRavi,Kumar,9123456780\n";
        let recs = parse_all(data, InputFormat::DelimitedText, MAX).unwrap();

        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].index, 0);
        assert_eq!(recs[0].field("first_name"), Some("Ana"));
        assert_eq!(recs[1].index, 1);
        assert_eq!(recs[1].field("phone_number"), Some("9123456780"));
    }

    #[test]
    fn csv_limpia_bom_y_normaliza_alias() {
        let data = "\u{feff}First Name,Surname,Mobile\nAna,Rao,9876543210\n";
        let recs = parse_all(data.as_bytes(), InputFormat::DelimitedText, MAX).unwrap();

        assert_eq!(recs[0].field("first_name"), Some("Ana"));
        assert_eq!(recs[0].field("last_name"), Some("Rao"));
        assert_eq!(recs[0].field("phone_number"), Some("9876543210"));
    }

    #[test]
    fn csv_tolera_filas_cortas_y_salta_filas_vacias() {
        let data = b"first_name,last_name,phone_number\nAna\n,,\n\nRavi,Kumar,9123456780\n";
        let recs = parse_all(data, InputFormat::DelimitedText, MAX).unwrap();

        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].field("last_name"), None);
        // la fila vacía no consume posición
        assert_eq!(recs[1].index, 1);
        assert_eq!(recs[1].field("first_name"), Some("Ravi"));
    }

    #[test]
    fn csv_detecta_punto_y_coma() {
        let data = b"first_name;last_name;phone_number\nAna;Rao;9876543210\n";
        let recs = parse_all(data, InputFormat::DelimitedText, MAX).unwrap();
        assert_eq!(recs[0].field("last_name"), Some("Rao"));
    }

    #[test]
    fn hoja_de_calculo_usa_tabulaciones() {
        let data = b"first_name\tlast_name\tphone_number\nAna\tRao, Devi\t9876543210\n";
        let recs = parse_all(data, InputFormat::Spreadsheet, MAX).unwrap();
        assert_eq!(recs[0].field("last_name"), Some("Rao, Devi"));
    }

    #[test]
    fn payload_vacio_o_solo_encabezado_es_error_de_formato() {
        assert_eq!(
            parse_all(b"   \n", InputFormat::DelimitedText, MAX).unwrap_err(),
            FormatError::Empty
        );
        assert_eq!(
            parse_all(b"first_name,phone_number\n", InputFormat::DelimitedText, MAX).unwrap_err(),
            FormatError::NoRecords
        );
    }

    #[test]
    fn utf8_invalido_es_error_de_formato() {
        let data = b"first_name,phone_number\n\xff\xfe,123\n";
        assert_eq!(
            parse_all(data, InputFormat::DelimitedText, MAX).unwrap_err(),
            FormatError::NotUtf8
        );
    }

    #[test]
    fn json_acepta_arreglo_objeto_envoltorio_y_lineas() {
        let arreglo = br#"[{"first_name":"Ana","land_acres":2.5,"email":null}]"#;
        let recs = parse_all(arreglo, InputFormat::StructuredJson, MAX).unwrap();
        assert_eq!(recs[0].field("land_acres"), Some("2.5"));
        assert!(!recs[0].fields.contains_key("email"));

        let envoltorio = br#"{"farmers":[{"Mobile":"9876543210"},{"Mobile":"9123456780"}]}"#;
        let recs = parse_all(envoltorio, InputFormat::StructuredJson, MAX).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].field("phone_number"), Some("9123456780"));

        let lineas = b"{\"first_name\":\"Ana\"}\n\n{\"first_name\":\"Ravi\"}\n";
        let recs = parse_all(lineas, InputFormat::StructuredJson, MAX).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].index, 1);
    }

    #[test]
    fn json_con_elementos_que_no_son_objetos_falla() {
        let data = br#"[{"first_name":"Ana"}, 42]"#;
        assert_eq!(
            parse_all(data, InputFormat::StructuredJson, MAX).unwrap_err(),
            FormatError::NotAnObject { index: 1 }
        );
    }

    #[test]
    fn json_malformado_falla() {
        let data = b"{\"first_name\": \"Ana\"\n{oops";
        assert!(matches!(
            parse_all(data, InputFormat::StructuredJson, MAX).unwrap_err(),
            FormatError::Json(_)
        ));
    }

    #[test]
    fn limite_de_registros() {
        let data = b"first_name\na\nb\nc\n";
        assert_eq!(
            parse_all(data, InputFormat::DelimitedText, 2).unwrap_err(),
            FormatError::TooManyRecords { found: 3, max: 2 }
        );
    }

    #[test]
    fn parsear_dos_veces_da_el_mismo_resultado() {
        let data = b"first_name,last_name,phone_number\nAna,Rao,9876543210\nRavi,,91234\n";
        let a = parse_all(data, InputFormat::DelimitedText, MAX).unwrap();
        let b = parse_all(data, InputFormat::DelimitedText, MAX).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn el_iterador_es_perezoso() {
        let data = b"first_name\nAna\nRavi\nLata\n";
        let mut it = records(data, InputFormat::DelimitedText).unwrap();
        let first = it.next().unwrap().unwrap();
        assert_eq!(first.field("first_name"), Some("Ana"));
        assert_eq!(it.count(), 2);
    }
}
