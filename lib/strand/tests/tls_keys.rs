// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Exhausts the process-wide key registry, lives in its own test binary so
//! no other test competes for keys.

use strand::tls::{self, TLS_KEYS_MAX};
use strand::StrandError;

#[test]
fn key_registry_is_bounded() {
    let _r = env_logger::try_init();

    let mut keys = Vec::with_capacity(TLS_KEYS_MAX);
    let err = loop {
        match tls::create_key() {
            Ok(key) => keys.push(key),
            Err(e) => break e,
        }
        assert!(keys.len() <= TLS_KEYS_MAX, "Registry is not bounded");
    };

    assert_eq!(err, StrandError::ResourceExhausted);
    assert_eq!(keys.len(), TLS_KEYS_MAX);
    assert_eq!(
        tls::create_key_with_destructor(|_v| {}),
        Err(StrandError::ResourceExhausted)
    );

    // A deleted key frees its slot again
    let freed = keys.swap_remove(TLS_KEYS_MAX / 2);
    tls::delete_key(freed).unwrap();
    let key = tls::create_key().unwrap();
    assert_ne!(key, freed);
    keys.push(key);
    assert_eq!(tls::create_key(), Err(StrandError::ResourceExhausted));

    for key in keys {
        tls::delete_key(key).unwrap();
    }
}
