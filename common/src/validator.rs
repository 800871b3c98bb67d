use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;

use chrono::{Datelike, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::record::{FarmerInput, ParsedRecord};

const MAX_NAME_LEN: usize = 100;
const MIN_AGE: i32 = 18;
const MAX_AGE: i32 = 120;
const MAX_LAND_ACRES: f64 = 10_000.0;
const MAX_EXPERIENCE_YEARS: u32 = 100;

const REQUIRED_FIELDS: &[&str] = &["first_name", "last_name", "phone_number"];

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("regex de email válida"))
}

/// Problema detectado en un campo de un registro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Reporte completo de validación (no se corta en el primer error).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total_records: usize,
    pub valid_records: usize,
    pub invalid_records: usize,
    /// índice del registro -> problemas encontrados
    pub errors: BTreeMap<usize, Vec<ValidationIssue>>,
}

impl ValidationReport {
    pub fn is_valid(&self, index: usize) -> bool {
        !self.errors.contains_key(&index)
    }

    /// Detalle legible de los errores de un registro.
    pub fn detail(&self, index: usize) -> Option<String> {
        self.errors.get(&index).map(|issues| {
            issues
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        })
    }
}

/// Resultado de validar un lote: el reporte y los agricultores aptos para crear.
#[derive(Debug, Clone)]
pub struct ValidatedBatch {
    pub report: ValidationReport,
    pub eligible: Vec<(usize, FarmerInput)>,
}

/// Valida el lote completo usando la fecha de hoy para el cálculo de edad.
pub fn validate_batch(records: &[ParsedRecord]) -> ValidatedBatch {
    validate_batch_at(records, Utc::now().date_naive())
}

pub fn validate_batch_at(records: &[ParsedRecord], today: NaiveDate) -> ValidatedBatch {
    let mut errors: BTreeMap<usize, Vec<ValidationIssue>> = BTreeMap::new();
    let mut candidates: Vec<(usize, FarmerInput)> = Vec::new();

    for rec in records {
        match validate_record(rec, today) {
            Ok(farmer) => candidates.push((rec.index, farmer)),
            Err(issues) => {
                errors.insert(rec.index, issues);
            }
        }
    }

    // Reglas entre registros: duplicados dentro del lote
    flag_duplicates(records, "phone_number", normalize_phone, &mut errors);
    flag_duplicates(records, "aadhaar_number", normalize_aadhaar, &mut errors);

    let eligible: Vec<(usize, FarmerInput)> = candidates
        .into_iter()
        .filter(|(idx, _)| !errors.contains_key(idx))
        .collect();

    let report = ValidationReport {
        total_records: records.len(),
        valid_records: eligible.len(),
        invalid_records: errors.len(),
        errors,
    };

    ValidatedBatch { report, eligible }
}

fn validate_record(rec: &ParsedRecord, today: NaiveDate) -> Result<FarmerInput, Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    for field in REQUIRED_FIELDS {
        if rec.field(field).is_none() {
            issues.push(ValidationIssue::new(field, "campo obligatorio"));
        }
    }

    let first_name = check_name(rec, "first_name", &mut issues);
    let last_name = check_name(rec, "last_name", &mut issues);

    let phone_number = rec.field("phone_number").and_then(|raw| {
        let normalized = normalize_phone(raw);
        if normalized.is_none() {
            issues.push(ValidationIssue::new(
                "phone_number",
                format!("formato inválido '{raw}' (se esperan 10 dígitos que empiecen con 6-9)"),
            ));
        }
        normalized
    });

    let email = rec.field("email").and_then(|raw| {
        if email_regex().is_match(raw) {
            Some(raw.to_lowercase())
        } else {
            issues.push(ValidationIssue::new("email", format!("formato inválido '{raw}'")));
            None
        }
    });

    let aadhaar_number = rec.field("aadhaar_number").and_then(|raw| {
        let normalized = normalize_aadhaar(raw);
        if normalized.is_none() {
            issues.push(ValidationIssue::new(
                "aadhaar_number",
                "formato inválido (se esperan 12 dígitos)",
            ));
        }
        normalized
    });

    let pincode = rec.field("pincode").and_then(|raw| {
        let ok = raw.len() == 6
            && raw.chars().all(|c| c.is_ascii_digit())
            && !raw.starts_with('0');
        if ok {
            Some(raw.to_string())
        } else {
            issues.push(ValidationIssue::new("pincode", format!("formato inválido '{raw}'")));
            None
        }
    });

    let gender = rec.field("gender").and_then(|raw| {
        match raw.to_ascii_lowercase().as_str() {
            "male" | "m" => Some("male".to_string()),
            "female" | "f" => Some("female".to_string()),
            "other" | "o" => Some("other".to_string()),
            _ => {
                issues.push(ValidationIssue::new(
                    "gender",
                    format!("valor desconocido '{raw}' (male, female, other)"),
                ));
                None
            }
        }
    });

    let date_of_birth = rec.field("date_of_birth").and_then(|raw| {
        let parsed = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"));
        match parsed {
            Ok(dob) => {
                let age = age_at(dob, today);
                if (MIN_AGE..=MAX_AGE).contains(&age) {
                    Some(dob)
                } else {
                    issues.push(ValidationIssue::new(
                        "date_of_birth",
                        format!("edad fuera de rango: {age} (entre {MIN_AGE} y {MAX_AGE})"),
                    ));
                    None
                }
            }
            Err(_) => {
                issues.push(ValidationIssue::new(
                    "date_of_birth",
                    format!("fecha inválida '{raw}' (AAAA-MM-DD)"),
                ));
                None
            }
        }
    });

    let land_acres = rec.field("land_acres").and_then(|raw| match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 && v <= MAX_LAND_ACRES => Some(v),
        Ok(v) => {
            issues.push(ValidationIssue::new(
                "land_acres",
                format!("fuera de rango: {v} (mayor que 0 y hasta {MAX_LAND_ACRES})"),
            ));
            None
        }
        Err(_) => {
            issues.push(ValidationIssue::new("land_acres", format!("no es un número '{raw}'")));
            None
        }
    });

    let experience_years = rec.field("experience_years").and_then(|raw| match raw.parse::<u32>() {
        Ok(v) if v <= MAX_EXPERIENCE_YEARS => Some(v),
        _ => {
            issues.push(ValidationIssue::new(
                "experience_years",
                format!("valor inválido '{raw}' (entero entre 0 y {MAX_EXPERIENCE_YEARS})"),
            ));
            None
        }
    });

    if !issues.is_empty() {
        return Err(issues);
    }

    match (first_name, last_name, phone_number) {
        (Some(first_name), Some(last_name), Some(phone_number)) => Ok(FarmerInput {
            first_name,
            last_name,
            phone_number,
            email,
            aadhaar_number,
            gender,
            date_of_birth,
            village: rec.field("village").map(str::to_string),
            district: rec.field("district").map(str::to_string),
            state: rec.field("state").map(str::to_string),
            pincode,
            land_acres,
            experience_years,
        }),
        // sin issues los tres campos obligatorios están presentes
        _ => Err(vec![ValidationIssue::new("record", "registro incompleto")]),
    }
}

fn check_name(rec: &ParsedRecord, field: &str, issues: &mut Vec<ValidationIssue>) -> Option<String> {
    let raw = rec.field(field)?;
    if raw.chars().count() > MAX_NAME_LEN {
        issues.push(ValidationIssue::new(
            field,
            format!("demasiado largo (máximo {MAX_NAME_LEN} caracteres)"),
        ));
        return None;
    }
    let ok = raw
        .chars()
        .all(|c| c.is_alphabetic() || c == ' ' || c == '.' || c == '\'' || c == '-');
    if !ok {
        issues.push(ValidationIssue::new(field, format!("caracteres inválidos en '{raw}'")));
        return None;
    }
    Some(raw.to_string())
}

/// Normaliza un celular indio a 10 dígitos (acepta prefijos +91, 91 o 0).
pub fn normalize_phone(raw: &str) -> Option<String> {
    let mut digits: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();

    if let Some(rest) = digits.strip_prefix('+') {
        if !rest.starts_with("91") {
            return None;
        }
        digits = rest.to_string();
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let national = match digits.len() {
        10 => digits.as_str(),
        11 if digits.starts_with('0') => &digits[1..],
        12 if digits.starts_with("91") => &digits[2..],
        _ => return None,
    };
    if !matches!(national.as_bytes().first(), Some(b'6'..=b'9')) {
        return None;
    }
    Some(national.to_string())
}

/// Normaliza un número Aadhaar: 12 dígitos, sin espacios ni guiones, que no empieza con 0 ni 1.
pub fn normalize_aadhaar(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| !matches!(c, ' ' | '-')).collect();
    let ok = digits.len() == 12
        && digits.chars().all(|c| c.is_ascii_digit())
        && !digits.starts_with('0')
        && !digits.starts_with('1');
    ok.then_some(digits)
}

fn age_at(dob: NaiveDate, today: NaiveDate) -> i32 {
    let mut age = today.year() - dob.year();
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    age
}

/// Marca todos los registros que comparten el mismo valor normalizado de `field`.
fn flag_duplicates(
    records: &[ParsedRecord],
    field: &str,
    normalize: fn(&str) -> Option<String>,
    errors: &mut BTreeMap<usize, Vec<ValidationIssue>>,
) {
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for rec in records {
        if let Some(value) = rec.field(field).and_then(normalize) {
            groups.entry(value).or_default().push(rec.index);
        }
    }

    for indices in groups.values().filter(|g| g.len() > 1) {
        for &idx in indices {
            let others: Vec<String> = indices
                .iter()
                .filter(|&&o| o != idx)
                .map(|o| o.to_string())
                .collect();
            errors.entry(idx).or_default().push(ValidationIssue::new(
                field,
                format!("duplicado dentro del lote (registros {})", others.join(", ")),
            ));
        }
    }
}
