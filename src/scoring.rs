use serde::Serialize;

pub const DEFAULT_WILSON_Z: f64 = 1.96;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityScore {
    pub quality_bayes: f64,
    pub quality_wilson: f64,
    pub quality: f64,
}

/// Rating shrunk towards the corpus mean `c` with weight `m`.
pub fn bayesian_average(rating: f64, votes: u64, c: f64, m: f64) -> f64 {
    if votes == 0 {
        return c;
    }
    let v = votes as f64;
    (v / (v + m)) * rating + (m / (v + m)) * c
}

/// Lower Wilson bound for the rating read as a share of a 5-point scale.
pub fn wilson_lower_bound(rating: f64, votes: u64, z: f64) -> f64 {
    if votes == 0 {
        return 0.0;
    }
    let v = votes as f64;
    let p = rating / 5.0;
    let z2 = z * z;
    let denom = 1.0 + z2 / v;
    let center = p + z2 / (2.0 * v);
    let margin = z * ((p * (1.0 - p) + z2 / (4.0 * v)) / v).sqrt();
    ((center - margin) / denom).max(0.0)
}

pub fn quality_score(rating: f64, votes: u64, c: f64, m: f64, z: f64) -> QualityScore {
    let quality_bayes = 20.0 * bayesian_average(rating, votes, c, m);
    let quality_wilson = 100.0 * wilson_lower_bound(rating, votes, z);
    QualityScore {
        quality_bayes,
        quality_wilson,
        quality: 0.75 * quality_bayes + 0.25 * quality_wilson,
    }
}

/// Decays from 100 at zero minutes; `k` is the e-folding time.
pub fn travel_score(minutes: f64, k: f64) -> f64 {
    100.0 * (-minutes / k).exp()
}
