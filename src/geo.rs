use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

const EARTH_RADIUS_KM: f64 = 6371.0;
const KM_PER_DEGREE_LAT: f64 = 111.0;
const SCAN_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        haversine_km(self.lat, self.lon, other.lat, other.lon)
    }
}

/// A harvest origin: a configured hub or a synthesized grid/scan point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestPoint {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub lat: f64,
    pub lon: f64,
}

impl HarvestPoint {
    pub fn new(id: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            id: id.into(),
            name: None,
            lat,
            lon,
        }
    }

    pub fn named(id: impl Into<String>, name: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(id, lat, lon)
        }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lon)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    /// Box spanning `radius_km` in every direction from `center`.
    pub fn around(center: Coordinates, radius_km: f64) -> Self {
        let delta_lat = radius_km / KM_PER_DEGREE_LAT;
        let cos_lat = center.lat.to_radians().cos().max(0.01);
        let delta_lon = radius_km / (KM_PER_DEGREE_LAT * cos_lat);
        Self {
            lat_min: center.lat - delta_lat,
            lat_max: center.lat + delta_lat,
            lon_min: center.lon - delta_lon,
            lon_max: center.lon + delta_lon,
        }
    }
}

pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Uniform `n`×`n` lattice over the box, corners included.
pub fn grid_points(bbox: &BoundingBox, n: usize) -> AppResult<Vec<HarvestPoint>> {
    if n <= 1 {
        return Err(AppError::config(format!("grid size must be > 1, got {n}")));
    }
    let lat_step = (bbox.lat_max - bbox.lat_min) / (n - 1) as f64;
    let lon_step = (bbox.lon_max - bbox.lon_min) / (n - 1) as f64;

    let mut points = Vec::with_capacity(n * n);
    for r in 0..n {
        for c in 0..n {
            points.push(HarvestPoint::named(
                format!("grid_{r}_{c}"),
                format!("Grid {r},{c}"),
                bbox.lat_min + r as f64 * lat_step,
                bbox.lon_min + c as f64 * lon_step,
            ));
        }
    }
    Ok(points)
}

/// Points on a `step_km` lattice that fall inside the scan circle, ids `{prefix}_{idx}`.
pub fn radius_scan_points(
    prefix: &str,
    center: Coordinates,
    radius_km: f64,
    step_km: f64,
) -> AppResult<Vec<HarvestPoint>> {
    if step_km.is_nan() || step_km <= 0.0 {
        return Err(AppError::config("grid step must be positive"));
    }
    if radius_km.is_nan() || radius_km <= 0.0 {
        return Err(AppError::config("scan radius must be positive"));
    }

    let mut cos_center = center.lat.to_radians().cos();
    if cos_center.abs() < 1e-3 {
        cos_center = 1e-3;
    }
    let lat_step = step_km / KM_PER_DEGREE_LAT;
    let lon_step = step_km / (KM_PER_DEGREE_LAT * cos_center);
    let lat_delta = radius_km / KM_PER_DEGREE_LAT;
    let lon_delta = radius_km / (KM_PER_DEGREE_LAT * cos_center);

    let mut points = Vec::new();
    let mut lat = center.lat - lat_delta;
    while lat <= center.lat + lat_delta + SCAN_EPSILON {
        let mut lon = center.lon - lon_delta;
        while lon <= center.lon + lon_delta + SCAN_EPSILON {
            if haversine_km(lat, lon, center.lat, center.lon) <= radius_km + SCAN_EPSILON {
                let id = format!("{prefix}_{}", points.len());
                points.push(HarvestPoint::new(id, lat, lon));
            }
            lon += lon_step;
        }
        lat += lat_step;
    }
    Ok(points)
}

/// Nearest point and its distance, or `None` when `points` is empty.
pub fn nearest_point<'a>(
    location: Coordinates,
    points: &'a [HarvestPoint],
) -> Option<(&'a HarvestPoint, f64)> {
    points
        .iter()
        .map(|point| (point, location.distance_km(&point.coordinates())))
        .fold(None, |best, candidate| match best {
            Some((_, best_dist)) if best_dist <= candidate.1 => best,
            _ => Some(candidate),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_matches_known_distance() {
        // Warsaw centre to Krakow centre is roughly 252 km.
        let dist = haversine_km(52.2297, 21.0122, 50.0647, 19.9450);
        assert!((dist - 252.0).abs() < 3.0, "got {dist}");
        assert_eq!(haversine_km(10.0, 10.0, 10.0, 10.0), 0.0);
    }

    #[test]
    fn grid_covers_corners() {
        let bbox = BoundingBox {
            lat_min: 0.0,
            lat_max: 1.0,
            lon_min: 10.0,
            lon_max: 12.0,
        };
        let points = grid_points(&bbox, 3).unwrap();
        assert_eq!(points.len(), 9);
        assert_eq!(points[0].id, "grid_0_0");
        assert_eq!(points[8].id, "grid_2_2");
        assert!((points[8].lat - 1.0).abs() < 1e-9);
        assert!((points[8].lon - 12.0).abs() < 1e-9);
        assert!((points[4].lon - 11.0).abs() < 1e-9);
    }

    #[test]
    fn grid_rejects_degenerate_size() {
        let bbox = BoundingBox::around(Coordinates::new(52.0, 21.0), 5.0);
        assert!(matches!(grid_points(&bbox, 1), Err(AppError::Config(_))));
        assert!(matches!(grid_points(&bbox, 0), Err(AppError::Config(_))));
    }

    #[test]
    fn scan_points_stay_inside_radius() {
        let center = Coordinates::new(52.23, 21.01);
        let points = radius_scan_points("c", center, 3.0, 1.0).unwrap();
        assert!(!points.is_empty());
        assert_eq!(points[0].id, "c_0");
        for point in &points {
            assert!(center.distance_km(&point.coordinates()) <= 3.0 + 1e-6);
        }
        // The lattice includes the centre row and column.
        assert!(points
            .iter()
            .any(|p| center.distance_km(&p.coordinates()) < 0.05));
    }

    #[test]
    fn scan_points_validate_inputs() {
        let center = Coordinates::new(52.23, 21.01);
        assert!(radius_scan_points("c", center, 3.0, 0.0).is_err());
        assert!(radius_scan_points("c", center, -1.0, 1.0).is_err());
    }

    #[test]
    fn bounding_box_is_symmetric() {
        let bbox = BoundingBox::around(Coordinates::new(0.0, 0.0), 111.0);
        assert!((bbox.lat_max - 1.0).abs() < 1e-9);
        assert!((bbox.lon_min + 1.0).abs() < 1e-9);
    }

    #[test]
    fn nearest_point_prefers_first_on_tie() {
        let points = vec![
            HarvestPoint::new("a", 0.0, 1.0),
            HarvestPoint::new("b", 0.0, -1.0),
            HarvestPoint::new("c", 5.0, 5.0),
        ];
        let (point, dist) = nearest_point(Coordinates::new(0.0, 0.0), &points).unwrap();
        assert_eq!(point.id, "a");
        assert!(dist > 100.0 && dist < 112.0);
        assert!(nearest_point(Coordinates::new(0.0, 0.0), &[]).is_none());
    }
}
