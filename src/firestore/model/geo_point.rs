use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Latitude/longitude pair in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> FirestoreResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(invalid_argument(format!(
                "Latitude must be a number between -90 and 90, but was: {latitude}"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(invalid_argument(format!(
                "Longitude must be a number between -180 and 180, but was: {longitude}"
            )));
        }
        Ok(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(GeoPoint::new(10.0, 20.0).is_ok());
        let err = GeoPoint::new(100.0, 0.0).unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(GeoPoint::new(0.0, f64::NAN).is_err());
    }
}
