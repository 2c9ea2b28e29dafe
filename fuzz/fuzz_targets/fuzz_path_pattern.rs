#![no_main]

//! Fuzz target for path template compilation and matching.
//!
//! Arbitrary templates must either compile or fail with a validation error,
//! and a compiled pattern must answer any path without panicking. Captured
//! parameters must always be named by the template.

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use stubgate::path_pattern::PathPattern;

#[derive(Arbitrary, Debug)]
struct Input<'a> {
    template: &'a str,
    path: &'a str,
}

fuzz_target!(|input: Input<'_>| {
    let Ok(pattern) = PathPattern::compile(input.template) else {
        return;
    };
    let matched = pattern.matches(input.path);
    match pattern.match_path(input.path) {
        Some(params) => {
            assert!(matched);
            for (name, _) in params.iter() {
                assert!(pattern.params().iter().any(|spec| spec.name == name));
            }
        }
        None => assert!(!matched),
    }
});
