//! RPM × pressure → flow lookup for the gear pump.
//!
//! Datasheet map in ml/min. Zeros in the table are meaningful and handled
//! asymmetrically per row:
//! - **leading** zeros (low RPM at high pressure) are a true stall — the
//!   pump genuinely moves no water there;
//! - **trailing** zeros (after positive values) are missing/unreachable
//!   datasheet cells — interpolating through them would drag real flow
//!   readings to zero, so the row clamps to its last positive value.
//!
//! Inputs are clamped to the axis ranges; the pressure segment index is
//! bounded to `NUM_PRESSURE - 2` so the upper row access stays in range.

pub const NUM_RPM: usize = 10;
pub const NUM_PRESSURE: usize = 17;

pub const RPM_AXIS: [f32; NUM_RPM] = [
    600.0, 1000.0, 1500.0, 2000.0, 2500.0, 3000.0, 3500.0, 4000.0, 4500.0, 5000.0,
];

pub const PRESSURE_AXIS: [f32; NUM_PRESSURE] = [
    0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0,
];

/// Flow table `[pressure][rpm]` in ml/min.
pub const FLOW_TABLE: [[f32; NUM_RPM]; NUM_PRESSURE] = [
    [216.0, 372.0, 556.0, 726.0, 909.0, 1102.0, 1302.0, 1486.0, 1666.0, 1798.0], // 0 bar
    [78.0, 252.0, 448.0, 636.0, 830.0, 1020.0, 1218.0, 1404.0, 1600.0, 1755.0],  // 1 bar
    [0.0, 166.0, 350.0, 553.0, 746.0, 948.0, 1138.0, 1336.0, 1530.0, 0.0],       // 2 bar
    [0.0, 75.0, 266.0, 474.0, 668.0, 872.0, 1062.0, 1262.0, 1460.0, 0.0],        // 3 bar
    [0.0, 18.0, 198.0, 401.0, 606.0, 808.0, 1004.0, 1208.0, 1408.0, 0.0],        // 4 bar
    [0.0, 0.0, 120.0, 338.0, 548.0, 756.0, 944.0, 1162.0, 1360.0, 0.0],          // 5 bar
    [0.0, 0.0, 66.0, 284.0, 492.0, 704.0, 884.0, 1108.0, 0.0, 0.0],              // 6 bar
    [0.0, 0.0, 28.0, 226.0, 432.0, 642.0, 834.0, 1042.0, 0.0, 0.0],              // 7 bar
    [0.0, 0.0, 0.0, 172.0, 381.0, 590.0, 784.0, 990.0, 0.0, 0.0],                // 8 bar
    [0.0, 0.0, 0.0, 118.0, 334.0, 544.0, 733.0, 954.0, 0.0, 0.0],                // 9 bar
    [0.0, 0.0, 0.0, 79.0, 292.0, 494.0, 690.0, 0.0, 0.0, 0.0],                   // 10 bar
    [0.0, 0.0, 0.0, 38.0, 250.0, 454.0, 640.0, 0.0, 0.0, 0.0],                   // 11 bar
    [0.0, 0.0, 0.0, 0.0, 208.0, 420.0, 602.0, 0.0, 0.0, 0.0],                    // 12 bar
    [0.0, 0.0, 0.0, 0.0, 166.0, 384.0, 0.0, 0.0, 0.0, 0.0],                      // 13 bar
    [0.0, 0.0, 0.0, 0.0, 132.0, 344.0, 0.0, 0.0, 0.0, 0.0],                      // 14 bar
    [0.0, 0.0, 0.0, 0.0, 102.0, 0.0, 0.0, 0.0, 0.0, 0.0],                        // 15 bar
    [0.0, 0.0, 0.0, 0.0, 76.0, 0.0, 0.0, 0.0, 0.0, 0.0],                         // 16 bar
];

/// Look up flow in ml/min for the given RPM and pressure.
pub fn flow_ml_per_min(rpm: f32, pressure_bar: f32) -> f32 {
    let rpm = rpm.clamp(RPM_AXIS[0], RPM_AXIS[NUM_RPM - 1]);
    let pressure = pressure_bar.clamp(PRESSURE_AXIS[0], PRESSURE_AXIS[NUM_PRESSURE - 1]);

    // Pressure segment such that PRESSURE_AXIS[i] <= pressure <= [i+1];
    // i <= NUM_PRESSURE - 2 keeps i + 1 in bounds.
    let mut ip = 0;
    while ip < NUM_PRESSURE - 2 && PRESSURE_AXIS[ip + 1] <= pressure {
        ip += 1;
    }

    let p1 = PRESSURE_AXIS[ip];
    let p2 = PRESSURE_AXIS[ip + 1];
    let u = if p2 > p1 { (pressure - p1) / (p2 - p1) } else { 0.0 };

    let q1 = interp_row(ip, rpm);
    let q2 = interp_row(ip + 1, rpm);

    (q1 + u * (q2 - q1)).max(0.0)
}

/// Interpolate a single pressure row over RPM with the zero policy.
fn interp_row(p_idx: usize, rpm: f32) -> f32 {
    let row = &FLOW_TABLE[p_idx];

    let Some(first_nz) = row.iter().position(|&q| q > 0.0) else {
        return 0.0; // all-zero row: no flow
    };
    let Some(last_nz) = row.iter().rposition(|&q| q > 0.0) else {
        return 0.0;
    };

    // True no-flow region (leading zeros).
    if rpm < RPM_AXIS[first_nz] {
        return 0.0;
    }

    // Trailing-zero region: clamp to the last positive value.
    if rpm >= RPM_AXIS[last_nz] {
        return row[last_nz];
    }

    // RPM segment within [first_nz .. last_nz - 1].
    let mut ir = first_nz;
    while ir < last_nz - 1 && RPM_AXIS[ir + 1] <= rpm {
        ir += 1;
    }

    let r1 = RPM_AXIS[ir];
    let q1 = row[ir];
    if q1 <= 0.0 {
        return 0.0;
    }

    // Skip interior zero gaps to the next positive point.
    let mut ir2 = ir + 1;
    while ir2 <= last_nz && row[ir2] <= 0.0 {
        ir2 += 1;
    }
    if ir2 > last_nz {
        return q1;
    }

    let r2 = RPM_AXIS[ir2];
    let q2 = row[ir2];
    let t = if r2 > r1 { (rpm - r1) / (r2 - r1) } else { 0.0 };

    (q1 + t * (q2 - q1)).max(0.0)
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_row_at_zero_pressure() {
        // 0-bar row has no zeros; max RPM hits the last cell exactly.
        assert_eq!(flow_ml_per_min(5000.0, 0.0), 1798.0);
    }

    #[test]
    fn trailing_zero_clamps_to_last_positive() {
        // 2-bar row ends [.., 1530, 0]: RPM 5000 clamps to 1530.
        assert_eq!(flow_ml_per_min(5000.0, 2.0), 1530.0);
    }

    #[test]
    fn leading_zero_region_is_stall() {
        // 2-bar row starts with 0 at 600 RPM: true no-flow.
        assert_eq!(flow_ml_per_min(600.0, 2.0), 0.0);
    }

    #[test]
    fn exact_max_axis_hit_is_in_bounds() {
        // 16 bar, 5000 RPM: row [16] holds a single positive 76 at
        // 2500 RPM; beyond it the trailing clamp applies.
        assert_eq!(flow_ml_per_min(5000.0, 16.0), 76.0);
    }

    #[test]
    fn interpolates_between_grid_points() {
        // 0 bar between 600 and 1000 RPM: midway between 216 and 372.
        let q = flow_ml_per_min(800.0, 0.0);
        assert!((q - 294.0).abs() < 1e-3, "got {q}");
    }

    #[test]
    fn interpolates_between_pressure_rows() {
        // Midway between 0 and 1 bar at 600 RPM: (216 + 78) / 2.
        let q = flow_ml_per_min(600.0, 0.5);
        assert!((q - 147.0).abs() < 1e-3, "got {q}");
    }

    #[test]
    fn inputs_clamped_to_axes() {
        assert_eq!(flow_ml_per_min(10_000.0, -5.0), flow_ml_per_min(5000.0, 0.0));
        assert_eq!(flow_ml_per_min(0.0, 40.0), flow_ml_per_min(600.0, 16.0));
    }

    #[test]
    fn output_is_finite_and_nonnegative_everywhere() {
        let mut rpm = 0.0;
        while rpm <= 6000.0 {
            let mut p = -1.0;
            while p <= 18.0 {
                let q = flow_ml_per_min(rpm, p);
                assert!(q.is_finite() && q >= 0.0, "rpm={rpm} p={p} q={q}");
                p += 0.37;
            }
            rpm += 111.0;
        }
    }
}
