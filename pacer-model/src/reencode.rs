// Pacer
// Copyright (c) 2025-2026 The Project Pacer Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The re-encode gate: decides whether a just-finished frame blew its budget badly enough that
//! redoing it at a corrected QP is worth the cost.

use pacer_core::rc::{FrameKind, RcMode, RcTaskInfo};

use crate::RateController;

/// Verdict of the passive super-frame check.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameSizeCheck {
    /// The frame is within its size threshold, or no threshold is armed.
    Normal,
    /// The frame reached the armed per-type size threshold.
    Super,
}

impl RateController {
    /// Whether the finished frame must be re-encoded.
    ///
    /// The statistics window has not been committed yet, so the instantaneous bitrate estimate
    /// substitutes the actual frame size for the newest window sample.
    pub(crate) fn check_re_enc(&self, info: &RcTaskInfo) -> bool {
        let Some(bits) = self.bits.as_ref() else { return false };

        if self.reenc_cnt >= self.cfg.max_reencode_times {
            return false;
        }

        let bit_thr = match self.frame_kind {
            FrameKind::Intra => 3 * i64::from(info.bit_target) / 2,
            FrameKind::InterP => 3 * i64::from(info.bit_target),
            FrameKind::InterVi => 0,
        };

        if i64::from(info.bit_real) <= bit_thr {
            return false;
        }

        let stat_time = i64::from(self.cfg.stat_times);
        let last_ins_bps = bits.stat_bits.sum() / stat_time;
        let ins_bps = (last_ins_bps * stat_time - bits.stat_bits.newest()
            + i64::from(info.bit_real))
            / stat_time;

        match self.cfg.mode {
            RcMode::Cbr => {
                let target_bps = i64::from(self.cfg.bps_target);
                target_bps / 20 < ins_bps - last_ins_bps
                    && (target_bps + target_bps / 10 < ins_bps
                        || target_bps - target_bps / 10 > ins_bps)
            }
            _ => {
                let target_bps = i64::from(self.cfg.bps_max);
                target_bps - (target_bps >> 3) < ins_bps
                    && target_bps / 20 < ins_bps - last_ins_bps
            }
        }
    }

    /// Check the finished frame against the armed per-type super-frame thresholds. The check is
    /// passive: the verdict is reported to the caller, the model itself does not act on it.
    pub fn check_super_frame(&self, info: &RcTaskInfo) -> FrameSizeCheck {
        let thr = match self.frame_kind {
            FrameKind::Intra => self.super_i_bits_thr,
            _ => self.super_p_bits_thr,
        };

        match thr {
            Some(thr) if info.bit_real >= thr => FrameSizeCheck::Super,
            _ => FrameSizeCheck::Normal,
        }
    }

    /// Arm or disarm the super-frame size thresholds. Both start disarmed.
    pub fn set_super_frame_thresholds(&mut self, i_bits_thr: Option<i32>, p_bits_thr: Option<i32>) {
        self.super_i_bits_thr = i_bits_thr;
        self.super_p_bits_thr = p_bits_thr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacer_core::rc::{FpsCfg, RcCfg, RcTaskInfo};

    use crate::RateController;

    fn cbr_controller() -> RateController {
        let cfg = RcCfg {
            mode: RcMode::Cbr,
            igop: 60,
            bps_target: 1_000_000,
            bps_max: 1_200_000,
            fps: FpsCfg { fps_in_num: 30, fps_out_num: 30, fps_out_denorm: 1 },
            max_reencode_times: 1,
            ..Default::default()
        };
        RateController::try_new(&cfg).unwrap()
    }

    #[test]
    fn verify_gate_ignores_modest_overshoot() {
        let rc = cbr_controller();
        let info = RcTaskInfo { bit_target: 100_000, bit_real: 120_000, ..Default::default() };

        // 1.2x the budget is under the 1.5x INTRA threshold.
        assert!(!rc.check_re_enc(&info));
    }

    #[test]
    fn verify_gate_requires_bitrate_deviation() {
        let rc = cbr_controller();

        // Twice the budget trips the size threshold, but a frame this small barely moves the
        // instantaneous bitrate, so the gate stays shut.
        let info = RcTaskInfo { bit_target: 20_000, bit_real: 40_000, ..Default::default() };
        assert!(!rc.check_re_enc(&info));
    }

    #[test]
    fn verify_gate_opens_on_oversized_intra() {
        let rc = cbr_controller();

        // Three times the INTRA budget also lifts the instantaneous bitrate well above 1.1x the
        // target.
        let info = RcTaskInfo { bit_target: 289_855, bit_real: 869_565, ..Default::default() };
        assert!(rc.check_re_enc(&info));
    }

    #[test]
    fn verify_gate_respects_reencode_limit() {
        let mut rc = cbr_controller();
        let info = RcTaskInfo { bit_target: 289_855, bit_real: 869_565, ..Default::default() };

        rc.reenc_cnt = 1;
        assert!(!rc.check_re_enc(&info));
    }

    #[test]
    fn verify_super_frame_check_disarmed_by_default() {
        let mut rc = cbr_controller();
        let info = RcTaskInfo { bit_real: i32::MAX, ..Default::default() };

        assert_eq!(rc.check_super_frame(&info), FrameSizeCheck::Normal);

        rc.set_super_frame_thresholds(Some(500_000), Some(200_000));
        assert_eq!(rc.check_super_frame(&info), FrameSizeCheck::Super);
    }
}
