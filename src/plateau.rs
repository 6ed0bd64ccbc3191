//! `PlateauDetector` (spec §4.H): decides whether additional concurrency
//! is still paying off. A pure function of its measurement sequence
//! (invariant I5) — grounded in
//! `R2-bench/algorithms/plateau_check.py::PlateauCheck.is_plateau_reached`.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampMeasurement {
    pub concurrency: u32,
    pub throughput_gbps: f64,
    pub duration_s: f64,
}

pub struct PlateauDetector {
    threshold: f64,
    system_bandwidth_gbps: Option<f64>,
    measurements: Vec<RampMeasurement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub stop: bool,
    pub reason: String,
}

impl PlateauDetector {
    pub fn new(threshold: f64, system_bandwidth_gbps: Option<f64>) -> Self {
        Self {
            threshold,
            system_bandwidth_gbps,
            measurements: Vec::new(),
        }
    }

    pub fn add(&mut self, concurrency: u32, throughput_gbps: f64, duration_s: f64) {
        self.measurements.push(RampMeasurement {
            concurrency,
            throughput_gbps,
            duration_s,
        });
    }

    pub fn measurements(&self) -> &[RampMeasurement] {
        &self.measurements
    }

    /// Precedence-ordered plateau check (spec §4.H):
    /// 1. hard bandwidth cap, 2. peak regression, 3. not-enough-measurements,
    /// 4. plateau / consistent decline among the last three, 5. still improving.
    pub fn is_plateau(&self) -> Verdict {
        let Some(latest) = self.measurements.last() else {
            return Verdict {
                stop: false,
                reason: "not enough measurements".to_string(),
            };
        };

        if let Some(cap) = self.system_bandwidth_gbps {
            if cap > 0.0 && latest.throughput_gbps >= cap {
                return Verdict {
                    stop: true,
                    reason: "bandwidth limit reached".to_string(),
                };
            }
        }

        let peak = self
            .measurements
            .iter()
            .map(|m| m.throughput_gbps)
            .fold(f64::MIN, f64::max);
        if peak > 0.0 {
            let degradation = (peak - latest.throughput_gbps) / peak;
            if degradation > 0.2 {
                return Verdict {
                    stop: true,
                    reason: format!(
                        "significant degradation from peak: peak {peak:.2} -> current {:.2}",
                        latest.throughput_gbps
                    ),
                };
            }
        }

        if self.measurements.len() < 3 {
            return Verdict {
                stop: false,
                reason: "not enough measurements".to_string(),
            };
        }

        let recent = &self.measurements[self.measurements.len() - 3..];
        let changes: Vec<f64> = recent
            .windows(2)
            .filter_map(|pair| {
                let (prev, curr) = (pair[0].throughput_gbps, pair[1].throughput_gbps);
                if prev > 0.0 {
                    Some((curr - prev) / prev)
                } else {
                    None
                }
            })
            .collect();

        if !changes.is_empty() && changes.iter().all(|c| c.abs() < self.threshold) {
            return Verdict {
                stop: true,
                reason: format!("improvement below {:.0}% threshold", self.threshold * 100.0),
            };
        }

        if !changes.is_empty() && changes.iter().all(|c| *c < -0.1) {
            return Verdict {
                stop: true,
                reason: "consistent degradation".to_string(),
            };
        }

        Verdict {
            stop: false,
            reason: "still improving".to_string(),
        }
    }

    pub fn summary(&self) -> Verdict {
        self.is_plateau()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // S1: clean improvement.
    #[test]
    fn s1_clean_improvement_still_improving() {
        let mut d = PlateauDetector::new(0.2, None);
        d.add(8, 100.0, 60.0);
        d.add(16, 120.0, 60.0);
        d.add(24, 140.0, 60.0);
        let v = d.is_plateau();
        assert!(!v.stop);
        assert_eq!(v.reason, "still improving");
    }

    // S2: small improvements trigger plateau.
    #[test]
    fn s2_small_improvements_trigger_plateau() {
        let mut d = PlateauDetector::new(0.2, None);
        d.add(8, 100.0, 60.0);
        d.add(16, 105.0, 60.0);
        d.add(24, 108.0, 60.0);
        let v = d.is_plateau();
        assert!(v.stop);
        assert!(v.reason.contains("below") && v.reason.contains("threshold"));
    }

    // S3: degradation from peak.
    #[test]
    fn s3_degradation_from_peak() {
        let mut d = PlateauDetector::new(0.2, None);
        d.add(8, 100.0, 60.0);
        d.add(16, 150.0, 60.0);
        d.add(24, 100.0, 60.0);
        let v = d.is_plateau();
        assert!(v.stop);
        assert!(v.reason.contains("degradation from peak"));
        assert!(v.reason.contains("150"));
        assert!(v.reason.contains("100"));
    }

    // S4: hard bandwidth cap.
    #[test]
    fn s4_hard_bandwidth_cap() {
        let mut d = PlateauDetector::new(0.2, Some(5.0));
        d.add(8, 1.0, 60.0);
        d.add(16, 6.0, 60.0);
        let v = d.is_plateau();
        assert!(v.stop);
        assert_eq!(v.reason, "bandwidth limit reached");
    }

    // B3: fewer than 3 measurements never stops unless the hard cap fires.
    #[test]
    fn b3_fewer_than_three_measurements_never_stops_without_cap() {
        let mut d = PlateauDetector::new(0.2, None);
        assert!(!d.is_plateau().stop);
        d.add(8, 100.0, 60.0);
        assert!(!d.is_plateau().stop);
        d.add(16, 1000.0, 60.0);
        // Even with a huge jump (no degradation), under 3 measurements.
        assert!(!d.is_plateau().stop);
    }

    // Consistent decline is the narrow band where both consecutive changes
    // are more negative than -10% (so they don't read as "plateau") yet the
    // compounded drop from peak still stays at or under the 20% regression
    // cutoff, so step 2 doesn't pre-empt step 4's decline check.
    #[test]
    fn consistent_decline_stops() {
        let mut d = PlateauDetector::new(0.1, None);
        d.add(8, 100.0, 60.0);
        d.add(16, 89.9, 60.0);
        d.add(24, 80.8201, 60.0);
        let v = d.is_plateau();
        assert!(v.stop);
        assert_eq!(v.reason, "consistent degradation");
    }

    #[test]
    fn is_pure_function_of_sequence() {
        let mut d1 = PlateauDetector::new(0.2, None);
        let mut d2 = PlateauDetector::new(0.2, None);
        for (c, t) in [(8, 100.0), (16, 120.0), (24, 140.0)] {
            d1.add(c, t, 60.0);
            d2.add(c, t, 60.0);
        }
        assert_eq!(d1.is_plateau(), d2.is_plateau());
    }
}
