// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scan state tracking for the source task.

use log::debug;

use super::metadata::SCANID_OBS_COMPLETE;

/// Tracks the scan id reported by the telescope operating system and
/// renumbers observed scans into a dense zero-based index for the output.
#[derive(Debug, Default)]
pub struct ScanManager {
    last_scan_id: Option<i32>,
    scan_index: u32,
    observation_complete: bool,
}

impl ScanManager {
    pub fn new() -> ScanManager {
        ScanManager::default()
    }

    /// Record the scan id of the metadata record being processed. Idle
    /// cycles never reach this method; the caller skips them.
    pub fn update(&mut self, scan_id: i32) {
        if scan_id == SCANID_OBS_COMPLETE {
            self.observation_complete = true;
            return;
        }
        match self.last_scan_id {
            None => {
                debug!("First scan observed, id={scan_id}");
                self.last_scan_id = Some(scan_id);
            }
            Some(last) if last != scan_id => {
                debug!("Scan change {last} -> {scan_id}");
                self.scan_index += 1;
                self.last_scan_id = Some(scan_id);
            }
            _ => {}
        }
    }

    /// Dense zero-based index of the current scan.
    pub fn scan_index(&self) -> u32 {
        self.scan_index
    }

    pub fn observation_complete(&self) -> bool {
        self.observation_complete
    }
}
