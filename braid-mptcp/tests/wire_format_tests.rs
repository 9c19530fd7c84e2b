//! Wire-format conformance tests for the option codec.

use braid_mptcp::codec::{
    decode_options, dss_checksum, encode_options, Dss, DssMapping, MptcpOption, OPT_KIND,
};
use smallvec::SmallVec;

#[test]
fn capable_lengths_match_the_handshake_stage() {
    let syn = encode_options(&[MptcpOption::CapableSyn { checksum: false }]);
    let synack = encode_options(&[MptcpOption::CapableSynAck {
        checksum: false,
        key: 1,
    }]);
    let ack = encode_options(&[MptcpOption::CapableAck {
        checksum: false,
        key: 1,
        peer_key: 2,
    }]);
    assert_eq!(syn.len(), 4);
    assert_eq!(synack.len(), 12);
    assert_eq!(ack.len(), 20);
}

#[test]
fn join_lengths_match_the_handshake_stage() {
    let syn = encode_options(&[MptcpOption::JoinSyn {
        backup: false,
        addr_id: 1,
        token: 2,
        nonce: 3,
    }]);
    let synack = encode_options(&[MptcpOption::JoinSynAck {
        backup: false,
        addr_id: 1,
        auth: 2,
        nonce: 3,
    }]);
    let ack = encode_options(&[MptcpOption::JoinAck { auth: [0; 20] }]);
    assert_eq!(syn.len(), 12);
    assert_eq!(synack.len(), 16);
    assert_eq!(ack.len(), 24);
}

#[test]
fn add_addr_lengths_discriminate_forms() {
    let v4 = encode_options(&[MptcpOption::AddAddr {
        addr_id: 1,
        addr: "10.0.0.1".parse().unwrap(),
        port: None,
    }]);
    let v4p = encode_options(&[MptcpOption::AddAddr {
        addr_id: 1,
        addr: "10.0.0.1".parse().unwrap(),
        port: Some(80),
    }]);
    let v6 = encode_options(&[MptcpOption::AddAddr {
        addr_id: 1,
        addr: "2001:db8::1".parse().unwrap(),
        port: None,
    }]);
    let v6p = encode_options(&[MptcpOption::AddAddr {
        addr_id: 1,
        addr: "2001:db8::1".parse().unwrap(),
        port: Some(80),
    }]);
    assert_eq!(v4.len(), 8);
    assert_eq!(v4p.len(), 10);
    assert_eq!(v6.len(), 20);
    assert_eq!(v6p.len(), 22);
}

#[test]
fn dss_wire_layout() {
    // kind, len, subtype, flags A|M, ack, dsn, sub_seq, dlen
    let wire = encode_options(&[MptcpOption::Dss(Dss {
        data_ack: Some(0x0102_0304),
        mapping: Some(DssMapping {
            data_seq: 0x0506_0708,
            sub_seq: 0x090a_0b0c,
            data_len: 0x0d0e,
            checksum: None,
        }),
        data_fin: false,
    })]);
    assert_eq!(
        hex::encode(&wire),
        "1e1220050102030405060708090a0b0c0d0e"
    );
    assert_eq!(wire[0], OPT_KIND);
    assert_eq!(wire[1] as usize, wire.len());
}

#[test]
fn fail_option_carries_the_cutoff() {
    let wire = encode_options(&[MptcpOption::Fail { dsn: 0xcafe_babe }]);
    assert_eq!(wire.len(), 8);
    let parsed = decode_options(&wire);
    assert_eq!(parsed[0], MptcpOption::Fail { dsn: 0xcafe_babe });
}

#[test]
fn several_options_in_one_region() {
    let opts = vec![
        MptcpOption::Dss(Dss::ack(77)),
        MptcpOption::AddAddr {
            addr_id: 5,
            addr: "192.168.7.7".parse().unwrap(),
            port: None,
        },
        MptcpOption::RemoveAddr {
            ids: SmallVec::from_slice(&[9]),
        },
    ];
    let wire = encode_options(&opts);
    let parsed = decode_options(&wire);
    assert_eq!(parsed.as_slice(), opts.as_slice());
}

#[test]
fn checksum_matches_across_ends() {
    // The sender computes over (mapping fields, payload); the receiver
    // recomputes the same sum from the parsed option and the segment.
    let payload = b"multipath checksum vector";
    let sent = dss_checksum(1000, 20, payload.len() as u16, payload);

    let wire = encode_options(&[MptcpOption::Dss(Dss {
        data_ack: None,
        mapping: Some(DssMapping {
            data_seq: 1000,
            sub_seq: 20,
            data_len: payload.len() as u16,
            checksum: Some(sent),
        }),
        data_fin: false,
    })]);
    let parsed = decode_options(&wire);
    let MptcpOption::Dss(dss) = &parsed[0] else {
        panic!("expected DSS");
    };
    let m = dss.mapping.unwrap();
    assert_eq!(
        dss_checksum(m.data_seq, m.sub_seq, m.data_len, payload),
        m.checksum.unwrap()
    );
}

#[test]
fn hostile_input_never_panics() {
    // Truncation at every prefix of a valid batch.
    let wire = encode_options(&[
        MptcpOption::CapableAck {
            checksum: true,
            key: u64::MAX,
            peer_key: 0,
        },
        MptcpOption::Dss(Dss {
            data_ack: Some(1),
            mapping: Some(DssMapping {
                data_seq: 2,
                sub_seq: 3,
                data_len: 4,
                checksum: Some(5),
            }),
            data_fin: true,
        }),
    ]);
    for end in 0..wire.len() {
        let _ = decode_options(&wire[..end]);
    }
    // Random-ish garbage.
    let garbage: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
    let _ = decode_options(&garbage);
}
