use curve25519_dalek::edwards::EdwardsPoint;

use crate::basic_eddsa::EddsaSignature;
use crate::threshold_eddsa::party_i::{
    KeyGenCommit, KeyGenOpen, Keys, NonceOpen, PartialSignature, SecretShareMsg, SharedKeys,
};
use crate::threshold_eddsa::state_machine::keygen::LocalKey;
use crate::threshold_eddsa::{PartyId, PeerSet};

pub fn party_id(i: u16) -> PartyId {
    PartyId::new(i).expect("non-zero party id")
}

pub fn full_peer_set(n: u16) -> PeerSet {
    PeerSet::new((1..=n).map(party_id).collect()).expect("valid peer set")
}

/// Drives the keygen phase functions directly, the way the state machine
/// does, and returns every party's local key.
pub fn keygen_t_n_parties(t: u16, n: u16) -> Vec<LocalKey> {
    let mut rng = rand::rngs::OsRng;
    let peers = full_peer_set(n);

    let party_keys_vec: Vec<Keys> = peers
        .ids()
        .iter()
        .map(|&id| Keys::phase1_create(id, t, &mut rng))
        .collect();

    let comm_vec: Vec<KeyGenCommit> = party_keys_vec.iter().map(|k| k.phase1_broadcast()).collect();
    let open_vec: Vec<KeyGenOpen> = party_keys_vec
        .iter()
        .map(|k| k.phase2_opening(&mut rng))
        .collect();

    // all parties run the commitment checks:
    for (pos, (open, comm)) in open_vec.iter().zip(&comm_vec).enumerate() {
        Keys::phase2_verify_opening(open, comm, peers.id_at(pos), t).expect("opening verifies");
    }

    let mut local_keys = Vec::with_capacity(usize::from(n));
    for (me_pos, keys) in party_keys_vec.iter().enumerate() {
        let me = peers.id_at(me_pos);
        let shares: Vec<SecretShareMsg> = party_keys_vec
            .iter()
            .map(|dealer| dealer.phase2_share_for(me))
            .collect();
        for (open, share) in open_vec.iter().zip(&shares) {
            Keys::phase3_verify_share(open, share, me).expect("share verifies");
        }
        let (shared_keys, vk_vec) = keys
            .phase3_finalize(&peers, &open_vec, &shares)
            .expect("finalize");
        local_keys.push(LocalKey {
            shared_keys,
            vk_vec,
            peers: peers.clone(),
        });
    }

    // every party must have derived the very same group key
    let group = local_keys[0].public_key().compress();
    assert!(local_keys
        .iter()
        .all(|key| key.public_key().compress() == group));

    local_keys
}

/// Drives the signing phase functions directly for the quorum `s` and checks
/// that every participant aggregates the same valid signature.
pub fn sign(
    digest: [u8; 32],
    t: u16,
    n: u16,
    s: &[u16],
    keygen: Option<Vec<LocalKey>>,
) -> EddsaSignature {
    let keys = keygen.unwrap_or_else(|| keygen_t_n_parties(t, n));
    let quorum = PeerSet::new(s.iter().map(|&i| party_id(i)).collect()).expect("valid quorum");
    let mut rng = rand::rngs::OsRng;

    let participating: Vec<&LocalKey> = s.iter().map(|&i| &keys[usize::from(i) - 1]).collect();

    // round 1: everyone commits to a fresh nonce
    let (nonces, comms): (Vec<_>, Vec<_>) = participating
        .iter()
        .map(|_| SharedKeys::round1_commit(&mut rng))
        .unzip();

    // round 2: openings, verified against the commitments
    let opens: Vec<NonceOpen> = nonces.iter().map(SharedKeys::round2_open).collect();
    for (open, comm) in opens.iter().zip(&comms) {
        SharedKeys::round2_verify_opening(open, comm).expect("opening verifies");
    }
    let aggregated_nonce: EdwardsPoint = opens.iter().map(|o| o.R_i).sum();

    // round 3: partial responses
    let partials: Vec<PartialSignature> = participating
        .iter()
        .zip(&nonces)
        .map(|(key, nonce)| {
            key.shared_keys
                .round3_partial_sign(nonce, &quorum, &digest, &aggregated_nonce)
                .expect("partial sign")
        })
        .collect();

    // each party runs combine and outputs the signature
    let sigs: Vec<EddsaSignature> = participating
        .iter()
        .map(|key| {
            key.shared_keys
                .combine(&quorum, &digest, &opens, &partials)
                .expect("combine")
        })
        .collect();

    // test all signatures are equal
    let first = sigs[0];
    assert!(sigs.iter().all(|&sig| sig == first));
    // test the signatures pass verification under the group key
    assert!(first.verify(&digest, &keys[0].public_key()));

    first
}

#[cfg(test)]
mod scenarios {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::threshold_eddsa::party::{
        cancel_pair, OutboundFrame, Party, Recipient, SessionError, SessionOptions,
    };
    use crate::threshold_eddsa::state_machine::keygen::InvalidLocalKey;
    use crate::threshold_eddsa::wire::{Frame, PROTOCOL_KEYGEN, PROTOCOL_SIGN};
    use curve25519_dalek::scalar::Scalar;

    #[test]
    fn test_keygen_t1_n2() {
        keygen_t_n_parties(1, 2);
    }

    #[test]
    fn test_keygen_t2_n3() {
        keygen_t_n_parties(2, 3);
    }

    #[test]
    fn keygen_agreement_holds_for_small_networks() {
        for n in 2..=6u16 {
            for t in 1..n {
                keygen_t_n_parties(t, n);
            }
        }
    }

    // 2 out of 3, both quorums of the same key
    #[test]
    fn test_sign_n3_quorum_swap() {
        let digest = [1u8; 32];
        let keys = keygen_t_n_parties(1, 3);
        let first = sign(digest, 1, 3, &[1, 2], Some(keys.clone()));
        let second = sign(digest, 1, 3, &[2, 3], Some(keys.clone()));
        // both verify under the very same group key
        assert!(first.verify(&digest, &keys[0].public_key()));
        assert!(second.verify(&digest, &keys[0].public_key()));
    }

    // 4 out of 5
    #[test]
    fn test_sign_n5_t3_tprime4() {
        sign([0xaa; 32], 3, 5, &[2, 3, 4, 5], None);
    }

    // 6 out of 8
    #[test]
    fn test_sign_n8_t4_tprime6() {
        sign([100u8; 32], 4, 8, &[1, 2, 3, 5, 7, 8], None);
    }

    #[test]
    fn verification_points_interpolate_to_the_group_key_on_any_quorum() {
        use crate::threshold_eddsa::vss::lagrange_coefficient;
        use curve25519_dalek::traits::Identity;

        let keys = keygen_t_n_parties(2, 5);
        let key = &keys[0];
        for quorum_ids in [[1u16, 2, 3].as_slice(), &[1, 3, 5], &[2, 3, 4, 5]] {
            let ids: Vec<PartyId> = quorum_ids.iter().map(|&i| party_id(i)).collect();
            let mut acc = EdwardsPoint::identity();
            for &i in &ids {
                acc += *key.verification_point(i).unwrap() * lagrange_coefficient(&ids, i).unwrap();
            }
            assert_eq!(acc.compress(), key.public_key().compress());
        }
    }

    #[test]
    fn signature_verifies_under_independent_verifier() {
        let digest = [3u8; 32];
        let keys = keygen_t_n_parties(1, 2);
        let signature = sign(digest, 1, 2, &[1, 2], Some(keys.clone()));

        let vk = ed25519_dalek::VerifyingKey::from_bytes(
            keys[0].public_key().compress().as_bytes(),
        )
        .unwrap();
        let sig = ed25519_dalek::Signature::from_bytes(&signature.to_bytes());
        vk.verify_strict(&digest, &sig).unwrap();
    }

    #[test]
    fn faulty_share_is_attributed_to_its_dealer() {
        let mut rng = rand::rngs::OsRng;
        let dealer = Keys::phase1_create(party_id(2), 2, &mut rng);
        let open = dealer.phase2_opening(&mut rng);

        let bogus = SecretShareMsg {
            share: Scalar::random(&mut rng),
        };
        assert_eq!(
            Keys::phase3_verify_share(&open, &bogus, party_id(1)),
            Err(crate::Error::KeyGenInvalidShare)
        );
    }

    #[test]
    fn sub_threshold_partials_do_not_aggregate() {
        let mut rng = rand::rngs::OsRng;
        let digest = [9u8; 32];
        let keys = keygen_t_n_parties(2, 3);
        // only t = 2 participants; their lagrange weights interpolate the
        // wrong polynomial and the aggregate cannot verify
        let quorum = PeerSet::new(vec![party_id(1), party_id(2)]).unwrap();
        let participating = [&keys[0], &keys[1]];

        let (nonces, _comms): (Vec<_>, Vec<_>) = participating
            .iter()
            .map(|_| SharedKeys::round1_commit(&mut rng))
            .unzip();
        let opens: Vec<NonceOpen> = nonces.iter().map(SharedKeys::round2_open).collect();
        let aggregated: EdwardsPoint = opens.iter().map(|o| o.R_i).sum();
        let partials: Vec<PartialSignature> = participating
            .iter()
            .zip(&nonces)
            .map(|(key, nonce)| {
                key.shared_keys
                    .round3_partial_sign(nonce, &quorum, &digest, &aggregated)
                    .unwrap()
            })
            .collect();

        assert_eq!(
            keys[0]
                .shared_keys
                .combine(&quorum, &digest, &opens, &partials),
            Err(crate::Error::SignInvalidSignature)
        );
    }

    #[test]
    fn share_blob_roundtrips_and_rejects_corruption() {
        let keys = keygen_t_n_parties(1, 3);
        let blob = keys[1].to_bytes();

        let restored = LocalKey::from_bytes(&blob).unwrap();
        assert_eq!(restored.id(), keys[1].id());
        assert_eq!(
            restored.public_key().compress(),
            keys[1].public_key().compress()
        );

        // restored shares still produce valid signatures
        let mut set = keys.clone();
        set[1] = restored;
        sign([7u8; 32], 1, 3, &[2, 3], Some(set));

        // any single-bit corruption is rejected
        for byte in 0..blob.len() {
            for bit in 0..8 {
                let mut corrupt = blob.clone();
                corrupt[byte] ^= 1 << bit;
                assert!(
                    LocalKey::from_bytes(&corrupt).is_err(),
                    "flip of byte {} bit {} was not caught",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let keys = keygen_t_n_parties(1, 2);
        let blob = keys[0].to_bytes();
        assert!(matches!(
            LocalKey::from_bytes(&blob[..blob.len() - 1]),
            Err(InvalidLocalKey::Malformed)
        ));
        assert!(matches!(
            LocalKey::from_bytes(&[]),
            Err(InvalidLocalKey::Malformed)
        ));
    }

    // Party-level harness: a router task per party fans its outbound frames
    // out to the other parties, preserving per-sender ordering.

    type Tamper = Arc<dyn Fn(PartyId, &mut OutboundFrame) + Send + Sync>;

    fn connect(parties: &[Arc<Party>], t: u16) -> Vec<mpsc::Receiver<OutboundFrame>> {
        let peers = PeerSet::new(parties.iter().map(|p| p.id()).collect()).unwrap();
        parties
            .iter()
            .map(|party| {
                let (tx, rx) = mpsc::channel(64);
                party.init(peers.clone(), t, tx).unwrap();
                rx
            })
            .collect()
    }

    fn route(
        parties: Vec<Arc<Party>>,
        receivers: Vec<mpsc::Receiver<OutboundFrame>>,
        tamper: Option<Tamper>,
    ) {
        for (pos, mut rx) in receivers.into_iter().enumerate() {
            let parties = parties.clone();
            let from = parties[pos].id();
            let tamper = tamper.clone();
            tokio::spawn(async move {
                while let Some(mut out) = rx.recv().await {
                    if let Some(tamper) = &tamper {
                        tamper(from, &mut out);
                    }
                    match out.recipient {
                        Recipient::Broadcast => {
                            for party in parties.iter().filter(|p| p.id() != from) {
                                let _ = party.on_message(&out.bytes, from, true);
                            }
                        }
                        Recipient::Peer(to) => {
                            if let Some(party) = parties.iter().find(|p| p.id() == to) {
                                let _ = party.on_message(&out.bytes, from, false);
                            }
                        }
                    }
                }
            });
        }
    }

    async fn run_dkg_all(parties: &[Arc<Party>]) -> Vec<Result<LocalKey, SessionError>> {
        let handles: Vec<_> = parties
            .iter()
            .map(|party| {
                let party = party.clone();
                let (_handle, token) = cancel_pair();
                tokio::spawn(
                    async move { party.run_dkg(token, SessionOptions::default()).await },
                )
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    async fn run_sign_all(
        parties: &[Arc<Party>],
        digest: [u8; 32],
    ) -> Vec<Result<EddsaSignature, SessionError>> {
        let handles: Vec<_> = parties
            .iter()
            .map(|party| {
                let party = party.clone();
                let (_handle, token) = cancel_pair();
                tokio::spawn(async move {
                    party
                        .run_sign(token, digest, SessionOptions::default())
                        .await
                })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    fn make_parties(ids: &[u16]) -> Vec<Arc<Party>> {
        ids.iter()
            .map(|&i| Arc::new(Party::new(party_id(i))))
            .collect()
    }

    #[tokio::test]
    async fn party_dkg_then_sign_with_both_quorums() {
        let digest = [5u8; 32];
        let parties = make_parties(&[1, 2, 3]);

        let receivers = connect(&parties, 1);
        route(parties.clone(), receivers, None);
        let keys: Vec<_> = run_dkg_all(&parties)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let group = parties[0].group_public_key().unwrap();
        assert!(parties
            .iter()
            .all(|p| p.group_public_key().unwrap() == group));
        assert_eq!(keys[0].public_key().compress().to_bytes(), group);

        // quorum {1, 2}
        let quorum_a = vec![parties[0].clone(), parties[1].clone()];
        let receivers = connect(&quorum_a, 1);
        route(quorum_a.clone(), receivers, None);
        let sigs = run_sign_all(&quorum_a, digest).await;
        let first = sigs[0].as_ref().unwrap();
        let vk = ed25519_dalek::VerifyingKey::from_bytes(&group).unwrap();
        vk.verify_strict(&digest, &ed25519_dalek::Signature::from_bytes(&first.to_bytes()))
            .unwrap();
        for sig in &sigs {
            assert_eq!(sig.as_ref().unwrap().to_bytes(), first.to_bytes());
        }
        let first = first.to_bytes();

        // quorum {2, 3} signs the same digest under the same group key
        let quorum_b = vec![parties[1].clone(), parties[2].clone()];
        let receivers = connect(&quorum_b, 1);
        route(quorum_b.clone(), receivers, None);
        let sigs = run_sign_all(&quorum_b, digest).await;
        let swapped = sigs[0].as_ref().unwrap();
        vk.verify_strict(
            &digest,
            &ed25519_dalek::Signature::from_bytes(&swapped.to_bytes()),
        )
        .unwrap();
        // fresh nonces make the two signatures distinct
        assert_ne!(swapped.to_bytes().to_vec(), first.to_vec());
    }

    #[tokio::test]
    async fn party_five_node_network_signs_with_quorum_of_four() {
        let digest = [0xaa; 32];
        let parties = make_parties(&[1, 2, 3, 4, 5]);

        let receivers = connect(&parties, 3);
        route(parties.clone(), receivers, None);
        for result in run_dkg_all(&parties).await {
            result.unwrap();
        }
        let group = parties[0].group_public_key().unwrap();

        let quorum: Vec<_> = parties[1..].to_vec();
        let receivers = connect(&quorum, 3);
        route(quorum.clone(), receivers, None);
        let sigs = run_sign_all(&quorum, digest).await;
        let vk = ed25519_dalek::VerifyingKey::from_bytes(&group).unwrap();
        for sig in sigs {
            let sig = sig.unwrap();
            vk.verify_strict(&digest, &ed25519_dalek::Signature::from_bytes(&sig.to_bytes()))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn party_restored_shares_sign() {
        let keys = keygen_t_n_parties(1, 3);
        let digest = [0x17; 32];

        // quorum {1, 3} restored into fresh parties from blobs
        let parties = make_parties(&[1, 3]);
        parties[0].set_share(&keys[0].to_bytes()).unwrap();
        parties[1].set_share(&keys[2].to_bytes()).unwrap();

        let receivers = connect(&parties, 1);
        route(parties.clone(), receivers, None);
        let sigs = run_sign_all(&parties, digest).await;

        let group = keys[0].public_key().compress().to_bytes();
        let vk = ed25519_dalek::VerifyingKey::from_bytes(&group).unwrap();
        for sig in sigs {
            let sig = sig.unwrap();
            vk.verify_strict(&digest, &ed25519_dalek::Signature::from_bytes(&sig.to_bytes()))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn party_tampered_share_incriminates_its_dealer() {
        let parties = make_parties(&[1, 2, 3]);

        // the transport corrupts every share dealt by party 2
        let tamper: Tamper = Arc::new(|from: PartyId, out: &mut OutboundFrame| {
            if from != party_id(2) {
                return;
            }
            if let Recipient::Peer(_) = out.recipient {
                let mut frame = Frame::decode(&out.bytes).unwrap();
                if frame.protocol == PROTOCOL_KEYGEN && !frame.broadcast {
                    frame.payload = Scalar::from(7u64).to_bytes().to_vec();
                    out.bytes = frame.encode();
                }
            }
        });

        let receivers = connect(&parties, 2);
        route(parties.clone(), receivers, Some(tamper));
        let results = run_dkg_all(&parties).await;

        for honest in [0usize, 2] {
            match &results[honest] {
                Err(SessionError::Protocol { party, .. }) => assert_eq!(*party, party_id(2)),
                other => panic!("expected Protocol(2), got {:?}", other.as_ref().map(|_| ())),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn party_times_out_when_a_peer_stays_silent() {
        let parties = make_parties(&[1, 2, 3]);
        let receivers = connect(&parties, 2);
        route(parties.clone(), receivers, None);

        // party 3 never runs its session
        let handles: Vec<_> = parties[..2]
            .iter()
            .map(|party| {
                let party = party.clone();
                let (_handle, token) = cancel_pair();
                tokio::spawn(async move {
                    let options = SessionOptions {
                        deadline: Some(Duration::from_millis(500)),
                    };
                    party.run_dkg(token, options).await
                })
            })
            .collect();

        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(SessionError::Timeout)));
        }
    }

    #[tokio::test]
    async fn party_cancellation_is_idempotent() {
        let party = Arc::new(Party::new(party_id(1)));
        let (outgoing, _keep_rx) = mpsc::channel(16);
        party
            .init(full_peer_set(2), 1, outgoing)
            .unwrap();

        let (handle, token) = cancel_pair();
        let runner = {
            let party = party.clone();
            tokio::spawn(async move { party.run_dkg(token, SessionOptions::default()).await })
        };

        tokio::task::yield_now().await;
        handle.cancel();
        handle.cancel();

        assert!(matches!(
            runner.await.unwrap(),
            Err(SessionError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn party_runs_one_session_at_a_time() {
        let party = Arc::new(Party::new(party_id(1)));
        let (outgoing, _keep_rx) = mpsc::channel(16);
        party
            .init(full_peer_set(2), 1, outgoing)
            .unwrap();

        let (handle, token) = cancel_pair();
        let runner = {
            let party = party.clone();
            tokio::spawn(async move { party.run_dkg(token, SessionOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (_h2, token2) = cancel_pair();
        let second = party
            .run_sign(token2, [0u8; 32], SessionOptions::default())
            .await;
        assert!(matches!(second, Err(SessionError::Inconsistent(_))));

        handle.cancel();
        assert!(matches!(
            runner.await.unwrap(),
            Err(SessionError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn party_sign_without_share_is_not_ready() {
        let party = Arc::new(Party::new(party_id(1)));
        let (outgoing, _keep_rx) = mpsc::channel(16);
        party
            .init(full_peer_set(2), 1, outgoing)
            .unwrap();

        let (_handle, token) = cancel_pair();
        let result = party
            .run_sign(token, [0u8; 32], SessionOptions::default())
            .await;
        assert!(matches!(result, Err(SessionError::NotReady(_))));
    }

    #[tokio::test]
    async fn party_rejects_foreign_share_blob() {
        let keys = keygen_t_n_parties(1, 2);
        let party = Party::new(party_id(2));
        let result = party.set_share(&keys[0].to_bytes());
        assert!(matches!(result, Err(SessionError::Inconsistent(_))));
    }

    #[tokio::test]
    async fn party_replayed_frame_after_completion_has_no_effect() {
        let digest = [0x31; 32];
        let parties = make_parties(&[1, 2]);

        let receivers = connect(&parties, 1);
        route(parties.clone(), receivers, None);
        for result in run_dkg_all(&parties).await {
            result.unwrap();
        }
        let group = parties[0].group_public_key().unwrap();

        // capture party 1's round-3 partial while the quorum signs
        let captured: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
        let tamper: Tamper = {
            let captured = captured.clone();
            Arc::new(move |from: PartyId, out: &mut OutboundFrame| {
                if from != party_id(1) {
                    return;
                }
                let frame = Frame::decode(&out.bytes).unwrap();
                if frame.protocol == PROTOCOL_SIGN && frame.round == 3 {
                    *captured.lock().unwrap() = Some(out.bytes.clone());
                }
            })
        };

        let receivers = connect(&parties, 1);
        route(parties.clone(), receivers, Some(tamper));
        for sig in run_sign_all(&parties, digest).await {
            sig.unwrap();
        }

        // reinjecting the captured partial into the idle party is a no-op
        let replay = captured.lock().unwrap().clone().expect("captured a partial");
        parties[1].on_message(&replay, party_id(1), true).unwrap();
        assert_eq!(parties[1].group_public_key().unwrap(), group);

        // and the quorum can still run a fresh session afterwards
        let receivers = connect(&parties, 1);
        route(parties.clone(), receivers, None);
        for sig in run_sign_all(&parties, [0x32; 32]).await {
            sig.unwrap();
        }
    }
}
