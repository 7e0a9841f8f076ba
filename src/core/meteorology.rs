//! Meteorology alignment to observation timestamps
//!
//! Holds gridded meteorological records with explicit validity windows
//! (monthly reanalysis means, hourly analyses) and answers point-in-time
//! queries. A timestamp outside the loaded coverage is a hard error,
//! never silently substituted with the nearest record. A helper regrids
//! the selected fields onto the observation grid with shared continuous
//! weights.

use crate::core::regrid::{Regridder, RegridWeights};
use crate::types::{FluxError, FluxResult, GridGeometry, RasterData};
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use std::collections::BTreeMap;

/// 2-metre air temperature, Kelvin
pub const TEMPERATURE_2M: &str = "t2m";
/// Surface solar radiation downwards, J m^-2 per accumulation hour
pub const SSRD: &str = "ssrd";

/// Gridded scalar fields valid over one time window `[start, end)`
#[derive(Debug, Clone)]
pub struct MeteorologyField {
    pub grid: GridGeometry,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub fields: BTreeMap<String, RasterData>,
}

impl MeteorologyField {
    pub fn new(
        grid: GridGeometry,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        fields: BTreeMap<String, RasterData>,
    ) -> FluxResult<Self> {
        if end <= start {
            return Err(FluxError::InvalidParameter(format!(
                "validity window {} to {} is empty",
                start, end
            )));
        }
        if fields.is_empty() {
            return Err(FluxError::InvalidParameter(
                "meteorology record carries no fields".to_string(),
            ));
        }
        for (name, data) in &fields {
            if data.dim() != grid.shape() {
                return Err(FluxError::GridMismatch(format!(
                    "field '{}' shape {:?} does not match grid {}x{}",
                    name,
                    data.dim(),
                    grid.rows,
                    grid.cols
                )));
            }
        }
        Ok(Self {
            grid,
            start,
            end,
            fields,
        })
    }

    /// Record valid for one calendar month
    pub fn monthly(
        grid: GridGeometry,
        year: i32,
        month: u32,
        fields: BTreeMap<String, RasterData>,
    ) -> FluxResult<Self> {
        let start = month_start(year, month)?;
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        let end = month_start(next_year, next_month)?;
        Self::new(grid, start, end, fields)
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start <= timestamp && timestamp < self.end
    }
}

fn month_start(year: i32, month: u32) -> FluxResult<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| {
            FluxError::InvalidParameter(format!("invalid year/month {}-{:02}", year, month))
        })
}

/// Time-indexed store of meteorology records on one source grid
#[derive(Debug, Clone)]
pub struct MeteorologyAligner {
    records: Vec<MeteorologyField>,
    grid: GridGeometry,
}

impl MeteorologyAligner {
    /// Load records, requiring a shared grid and non-overlapping windows
    pub fn load(mut records: Vec<MeteorologyField>) -> FluxResult<Self> {
        if records.is_empty() {
            return Err(FluxError::NoCoverage(
                "no meteorology records loaded".to_string(),
            ));
        }
        let grid = records[0].grid.clone();
        for record in &records {
            if !record.grid.same_grid(&grid) {
                return Err(FluxError::GridMismatch(format!(
                    "meteorology record grid [{}] differs from [{}]",
                    record.grid.descriptor(),
                    grid.descriptor()
                )));
            }
        }
        records.sort_by_key(|r| r.start);
        for pair in records.windows(2) {
            if pair[1].start < pair[0].end {
                return Err(FluxError::InvalidParameter(format!(
                    "overlapping validity windows: {} to {} and {} to {}",
                    pair[0].start, pair[0].end, pair[1].start, pair[1].end
                )));
            }
        }
        info!(
            "Loaded {} meteorology records covering {} to {}",
            records.len(),
            records[0].start,
            records[records.len() - 1].end
        );
        Ok(Self { records, grid })
    }

    /// The record whose validity window contains `timestamp`
    pub fn at(&self, timestamp: DateTime<Utc>) -> FluxResult<&MeteorologyField> {
        let record = self
            .records
            .iter()
            .find(|r| r.contains(timestamp))
            .ok_or_else(|| {
                let (start, end) = self.coverage();
                FluxError::NoCoverage(format!(
                    "no meteorology record covers {} (loaded coverage {} to {})",
                    timestamp, start, end
                ))
            })?;
        debug!(
            "Meteorology for {}: window {} to {}",
            timestamp, record.start, record.end
        );
        Ok(record)
    }

    /// Overall `[start, end)` span of the loaded records
    pub fn coverage(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            self.records[0].start,
            self.records[self.records.len() - 1].end,
        )
    }

    pub fn grid(&self) -> &GridGeometry {
        &self.grid
    }

    /// Fields at `timestamp`, regridded onto the observation grid with
    /// previously built continuous weights
    pub fn aligned_at(
        &self,
        timestamp: DateTime<Utc>,
        weights: &RegridWeights,
    ) -> FluxResult<BTreeMap<String, RasterData>> {
        let record = self.at(timestamp)?;
        let mut aligned = BTreeMap::new();
        for (name, data) in &record.fields {
            aligned.insert(name.clone(), Regridder::apply(weights, data)?);
        }
        Ok(aligned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::regrid::RegridPolicy;
    use crate::types::{Crs, GeoTransform};
    use ndarray::Array2;

    fn met_grid() -> GridGeometry {
        GridGeometry::new(
            Crs::Geographic,
            2,
            2,
            GeoTransform::north_up(0.0, 2.0, 1.0, -1.0),
        )
    }

    fn record(year: i32, month: u32, t2m: f32) -> MeteorologyField {
        let mut fields = BTreeMap::new();
        fields.insert(
            TEMPERATURE_2M.to_string(),
            Array2::from_elem((2, 2), t2m),
        );
        fields.insert(SSRD.to_string(), Array2::from_elem((2, 2), 1.8e6));
        MeteorologyField::monthly(met_grid(), year, month, fields).unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_at_selects_containing_month() {
        let aligner =
            MeteorologyAligner::load(vec![record(2020, 6, 288.0), record(2020, 7, 292.0)]).unwrap();
        let june = aligner.at(utc(2020, 6, 15, 12)).unwrap();
        assert_eq!(june.fields[TEMPERATURE_2M][[0, 0]], 288.0);
        let july = aligner.at(utc(2020, 7, 1, 0)).unwrap();
        assert_eq!(july.fields[TEMPERATURE_2M][[0, 0]], 292.0);
    }

    #[test]
    fn test_beyond_last_month_is_no_coverage() {
        let aligner =
            MeteorologyAligner::load(vec![record(2020, 6, 288.0), record(2020, 7, 292.0)]).unwrap();
        // one day past the end of the last loaded month
        let result = aligner.at(utc(2020, 8, 1, 12));
        assert!(matches!(result, Err(FluxError::NoCoverage(_))));
    }

    #[test]
    fn test_before_first_month_is_no_coverage() {
        let aligner = MeteorologyAligner::load(vec![record(2020, 6, 288.0)]).unwrap();
        assert!(matches!(
            aligner.at(utc(2020, 5, 31, 23)),
            Err(FluxError::NoCoverage(_))
        ));
    }

    #[test]
    fn test_gap_between_months_is_no_coverage() {
        let aligner =
            MeteorologyAligner::load(vec![record(2020, 5, 285.0), record(2020, 7, 292.0)]).unwrap();
        assert!(matches!(
            aligner.at(utc(2020, 6, 10, 6)),
            Err(FluxError::NoCoverage(_))
        ));
    }

    #[test]
    fn test_overlapping_windows_are_rejected() {
        let a = record(2020, 6, 288.0);
        let mut fields = BTreeMap::new();
        fields.insert(TEMPERATURE_2M.to_string(), Array2::from_elem((2, 2), 290.0));
        let b = MeteorologyField::new(
            met_grid(),
            utc(2020, 6, 20, 0),
            utc(2020, 7, 20, 0),
            fields,
        )
        .unwrap();
        assert!(matches!(
            MeteorologyAligner::load(vec![a, b]),
            Err(FluxError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_empty_load_is_no_coverage() {
        assert!(matches!(
            MeteorologyAligner::load(Vec::new()),
            Err(FluxError::NoCoverage(_))
        ));
    }

    #[test]
    fn test_mismatched_record_grids_are_rejected() {
        let mut other = record(2020, 7, 290.0);
        other.grid.transform.top_left_x += 5.0;
        assert!(matches!(
            MeteorologyAligner::load(vec![record(2020, 6, 288.0), other]),
            Err(FluxError::GridMismatch(_))
        ));
    }

    #[test]
    fn test_field_shape_must_match_grid() {
        let mut fields = BTreeMap::new();
        fields.insert(TEMPERATURE_2M.to_string(), Array2::from_elem((3, 3), 288.0));
        let result = MeteorologyField::monthly(met_grid(), 2020, 6, fields);
        assert!(matches!(result, Err(FluxError::GridMismatch(_))));
    }

    #[test]
    fn test_december_window_rolls_over() {
        let rec = record(2020, 12, 270.0);
        assert_eq!(rec.start, utc(2020, 12, 1, 0));
        assert_eq!(rec.end, utc(2021, 1, 1, 0));
        assert!(rec.contains(utc(2020, 12, 31, 23)));
        assert!(!rec.contains(utc(2021, 1, 1, 0)));
    }

    #[test]
    fn test_aligned_at_regrids_fields() {
        let aligner = MeteorologyAligner::load(vec![record(2020, 6, 288.0)]).unwrap();
        let weights =
            Regridder::build(aligner.grid(), aligner.grid(), RegridPolicy::Continuous).unwrap();
        let aligned = aligner.aligned_at(utc(2020, 6, 10, 12), &weights).unwrap();
        assert_eq!(aligned[TEMPERATURE_2M].dim(), (2, 2));
        assert!((aligned[TEMPERATURE_2M][[1, 1]] - 288.0).abs() < 1e-4);
        assert!(aligned.contains_key(SSRD));
    }
}
