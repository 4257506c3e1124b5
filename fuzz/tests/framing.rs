//! Bolero fuzzer for value and control frame decoding.
//!
//! Properties tested:
//! - Only exactly 4 bytes decode as a value; short reads are truncations
//! - Decoded control frames are canonical
//! - Valid names always fit and survive a control frame

use bolero::check;
use tiersort_fuzz::framing_model::{check_name_frame, check_name_text, check_value_frame};

fn main() {
    check!().with_type::<Vec<u8>>().for_each(|bytes| {
        if let Err(e) = check_value_frame(bytes) {
            panic!("Value framing violated: {}", e);
        }
    });

    check!().with_type::<Vec<u8>>().for_each(|bytes| {
        if let Err(e) = check_name_frame(bytes) {
            panic!("Control framing violated: {}", e);
        }
    });

    check!().with_type::<Vec<u8>>().for_each(|tail| {
        // Bias towards frames that look like real names.
        let mut frame = b"/tiersort-".to_vec();
        frame.extend(tail.iter().map(|&b| if b == b'/' { b'-' } else { b }));
        frame.resize(128, 0);
        if let Err(e) = check_name_frame(&frame) {
            panic!("Control framing violated: {}", e);
        }
    });

    check!().with_type::<String>().for_each(|text| {
        if let Err(e) = check_name_text(text) {
            panic!("Name validation violated: {}", e);
        }
    });
}
