use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Input feature names in the order the service expects them.
pub const FEATURE_NAMES: [&str; 23] = [
    "TYPEHUQ", "HDD30YR", "CDD30YR", "BEDROOMS", "NCOMBATH", "TOTROOMS",
    "CELLAR", "GARGHEAT", "HEATROOM", "ACROOMS", "USECENAC", "TEMPNITEAC",
    "TOTSQFT", "TOTHSQFT", "TOTCSQFT", "KWH", "KWHCOL", "KWHRFG", "KWHOTH",
    "DOLELCOL", "DOLELWTH", "DOLELRFG", "DOLELOTH",
];

pub const TARGET_NAME: &str = "DOLLAREL";

pub fn housing_type_label(code: u8) -> &'static str {
    match code {
        1 => "Mobile Home",
        2 => "Single-Family Detached",
        3 => "Single-Family Attached",
        4 => "Apartment (2-4 units)",
        5 => "Apartment (5+ units)",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(rename = "train")]
    pub train_count: u64,
    #[serde(rename = "test")]
    pub test_count: u64,
    pub mae: f64,
    pub rmse: f64,
    pub mape: f64,
    pub accuracy: f64,
    pub k: u32,
    pub split: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub bins: Vec<f64>,
    pub counts: Vec<u64>,
    #[serde(default)]
    pub mean: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxStats {
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScatterSample {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    #[serde(rename = "type")]
    pub housing_type: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedVsActual {
    pub actual: Vec<f64>,
    pub predicted: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub features: Vec<String>,
    pub values: Vec<f64>,
}

/// Column name → describe() row (`count`, `mean`, `std`, `min`, `25%`, ...).
pub type SummaryTable = BTreeMap<String, BTreeMap<String, f64>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardResponse {
    #[serde(rename = "bill_hist")]
    pub bill_histogram: Histogram,
    /// Keyed by housing-type code.
    #[serde(rename = "box_data")]
    pub box_plot: BTreeMap<String, BoxStats>,
    pub scatter: ScatterSample,
    #[serde(rename = "pred_vs_act")]
    pub predicted_vs_actual: PredictedVsActual,
    pub correlation: Correlation,
    pub summary: SummaryTable,
    #[serde(rename = "residual_hist")]
    pub residual_histogram: Histogram,
    pub k: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KRow {
    pub k: u32,
    pub mae: f64,
    pub rmse: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KComparison {
    pub rows: Vec<KRow>,
    pub best_k: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub predicted: f64,
    pub monthly: f64,
    #[serde(rename = "avg")]
    pub dataset_avg: f64,
    #[serde(rename = "median")]
    pub dataset_median: f64,
    #[serde(rename = "pct_rank")]
    pub percentile_rank: f64,
    #[serde(rename = "delta_pct")]
    pub delta_percent: f64,
}

/// Household features in [`FEATURE_NAMES`] order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub Vec<f64>);

impl FeatureVector {
    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        let idx = FEATURE_NAMES.iter().position(|n| *n == name)?;
        self.0.get(idx).copied()
    }
}

/// The prediction form, with the defaults the form opens with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdForm {
    pub housing_type: u8,
    pub heating_degree_days: f64,
    pub cooling_degree_days: f64,
    pub bedrooms: f64,
    pub full_baths: f64,
    pub total_rooms: f64,
    pub cellar: bool,
    pub heated_garage: bool,
    pub rooms_heated: f64,
    pub rooms_cooled: f64,
    pub central_ac_use: f64,
    pub night_temp_ac: f64,
    pub total_sqft: f64,
    pub heated_sqft: f64,
    pub cooled_sqft: f64,
    pub kwh: f64,
    pub kwh_cooling: f64,
    pub kwh_fridge: f64,
    pub kwh_other: f64,
    pub cost_cooling: f64,
    pub cost_water_heating: f64,
    pub cost_fridge: f64,
    pub cost_other: f64,
}

impl Default for HouseholdForm {
    fn default() -> Self {
        Self {
            housing_type: 2,
            heating_degree_days: 3500.0,
            cooling_degree_days: 1200.0,
            bedrooms: 3.0,
            full_baths: 2.0,
            total_rooms: 7.0,
            cellar: false,
            heated_garage: false,
            rooms_heated: 5.0,
            rooms_cooled: 4.0,
            central_ac_use: 3.0,
            night_temp_ac: 72.0,
            total_sqft: 1800.0,
            heated_sqft: 1600.0,
            cooled_sqft: 1400.0,
            kwh: 11000.0,
            kwh_cooling: 2000.0,
            kwh_fridge: 800.0,
            kwh_other: 6000.0,
            cost_cooling: 200.0,
            cost_water_heating: 80.0,
            cost_fridge: 80.0,
            cost_other: 600.0,
        }
    }
}

impl HouseholdForm {
    pub fn to_features(&self) -> FeatureVector {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        FeatureVector(vec![
            self.housing_type as f64,
            self.heating_degree_days,
            self.cooling_degree_days,
            self.bedrooms,
            self.full_baths,
            self.total_rooms,
            flag(self.cellar),
            flag(self.heated_garage),
            self.rooms_heated,
            self.rooms_cooled,
            self.central_ac_use,
            self.night_temp_ac,
            self.total_sqft,
            self.heated_sqft,
            self.cooled_sqft,
            self.kwh,
            self.kwh_cooling,
            self.kwh_fridge,
            self.kwh_other,
            self.cost_cooling,
            self.cost_water_heating,
            self.cost_fridge,
            self.cost_other,
        ])
    }

    /// Apply a `NAME=value` override using the service's feature names.
    pub fn set(&mut self, name: &str, value: f64) -> bool {
        let slot = match name.to_ascii_uppercase().as_str() {
            "TYPEHUQ" => {
                self.housing_type = value.round().clamp(1.0, 5.0) as u8;
                return true;
            }
            "CELLAR" => {
                self.cellar = value != 0.0;
                return true;
            }
            "GARGHEAT" => {
                self.heated_garage = value != 0.0;
                return true;
            }
            "HDD30YR" => &mut self.heating_degree_days,
            "CDD30YR" => &mut self.cooling_degree_days,
            "BEDROOMS" => &mut self.bedrooms,
            "NCOMBATH" => &mut self.full_baths,
            "TOTROOMS" => &mut self.total_rooms,
            "HEATROOM" => &mut self.rooms_heated,
            "ACROOMS" => &mut self.rooms_cooled,
            "USECENAC" => &mut self.central_ac_use,
            "TEMPNITEAC" => &mut self.night_temp_ac,
            "TOTSQFT" => &mut self.total_sqft,
            "TOTHSQFT" => &mut self.heated_sqft,
            "TOTCSQFT" => &mut self.cooled_sqft,
            "KWH" => &mut self.kwh,
            "KWHCOL" => &mut self.kwh_cooling,
            "KWHRFG" => &mut self.kwh_fridge,
            "KWHOTH" => &mut self.kwh_other,
            "DOLELCOL" => &mut self.cost_cooling,
            "DOLELWTH" => &mut self.cost_water_heating,
            "DOLELRFG" => &mut self.cost_fridge,
            "DOLELOTH" => &mut self.cost_other,
            _ => return false,
        };
        *slot = value;
        true
    }
}
