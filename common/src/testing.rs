//! Dobles de prueba compartidos por los tests del crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CreateError;
use crate::farmer::FarmerCreator;
use crate::record::FarmerInput;

pub fn phone_for(i: usize) -> String {
    format!("9{:09}", i)
}

pub fn farmer(i: usize) -> FarmerInput {
    FarmerInput {
        first_name: "Lakshmi".to_string(),
        last_name: "Devi".to_string(),
        phone_number: phone_for(i),
        email: None,
        aadhaar_number: None,
        gender: None,
        date_of_birth: None,
        village: None,
        district: None,
        state: None,
        pincode: None,
        land_acres: None,
        experience_years: None,
    }
}

/// CSV con `n` agricultores válidos.
pub fn valid_csv(n: usize) -> String {
    let mut out = String::from("first_name,last_name,phone_number\n");
    for i in 0..n {
        out.push_str(&format!("Farmer,Number,{}\n", phone_for(i)));
    }
    out
}

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Ok,
    Duplicate,
    /// falla transitoriamente n veces y después crea
    TransientTimes(u32),
    AlwaysTransient,
    Panic,
    Sleep(Duration),
}

/// Creador con comportamiento programado por teléfono.
#[derive(Default)]
pub struct ScriptedCreator {
    script: HashMap<String, Behavior>,
    default: Option<Behavior>,
    calls: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedCreator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, index: usize, behavior: Behavior) -> Self {
        self.script.insert(phone_for(index), behavior);
        self
    }

    pub fn with_default(mut self, behavior: Behavior) -> Self {
        self.default = Some(behavior);
        self
    }

    pub fn calls_for(&self, index: usize) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(&phone_for(index))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FarmerCreator for ScriptedCreator {
    async fn create_farmer(&self, _fpo_org_id: &str, farmer: &FarmerInput) -> Result<String, CreateError> {
        let phone = farmer.phone_number.clone();
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let c = calls.entry(phone.clone()).or_insert(0);
            *c += 1;
            *c
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let behavior = self
            .script
            .get(&phone)
            .copied()
            .or(self.default)
            .unwrap_or(Behavior::Ok);

        let result = match behavior {
            Behavior::Ok => Ok(format!("farmer-{phone}")),
            Behavior::Duplicate => Err(CreateError::Duplicate(phone.clone())),
            Behavior::TransientTimes(n) if attempt <= n => {
                Err(CreateError::Transient("servicio no disponible".to_string()))
            }
            Behavior::TransientTimes(_) => Ok(format!("farmer-{phone}")),
            Behavior::AlwaysTransient => Err(CreateError::Transient("503".to_string())),
            Behavior::Panic => panic!("fallo inesperado en el creador"),
            Behavior::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(format!("farmer-{phone}"))
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
