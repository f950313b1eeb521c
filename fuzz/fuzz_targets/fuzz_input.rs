// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use logwarden::baseline::{extract_timestamp, marker_file_name, BaselineRecord};

#[derive(Arbitrary, Debug)]
struct Input<'a> {
    baseline_text: &'a str,
    stem: &'a str,
    compare_name: &'a str,
}

fuzz_target!(|input: Input<'_>| {
    if let Ok(ts) = extract_timestamp(input.baseline_text) {
        let name = marker_file_name(&ts, input.stem);
        if let Some(record) = BaselineRecord::from_marker_name(&name) {
            assert_eq!(record.time_info, ts.format("%Y%m%d_%H%M%S").to_string());
        }
    }

    if let Some(record) = BaselineRecord::from_marker_name(input.compare_name) {
        if let Some(renamed) = record.renamed(input.compare_name) {
            // A renamed file never matches a second time
            assert!(record.renamed(&renamed).is_none() || renamed.contains("#1"));
        }
    }
});
