//! In-memory two-party conversation over a simulated byte-stream transport.

use anyhow::{Context, Result};
use axolotl_crypto::prekey::generate_prekeys;
use axolotl_crypto::session::establish_session;
use axolotl_crypto::{
    generate_registration_id, IdentityKeyPair, MessageError, ProtocolStores, SessionCipher,
    SessionConfig, SessionError,
};
use axolotl_protocol::{decode_bundle, encode_bundle, encode_envelope, try_decode_envelope, ProtocolAddress};
use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{CryptoRng, RngCore, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub rounds: u32,
    pub messages_per_round: u32,
    pub shuffle: bool,
    pub replay: bool,
    pub seed: Option<u64>,
}

#[derive(Debug, Default, Serialize)]
pub struct SimulationReport {
    pub sent: u32,
    pub decrypted: u32,
    pub replays_rejected: u32,
    pub failures: Vec<String>,
}

impl SimulationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.decrypted == self.sent
    }
}

struct Party {
    name: &'static str,
    address: ProtocolAddress,
    stores: ProtocolStores,
}

impl Party {
    fn new<R: CryptoRng + RngCore>(name: &'static str, rng: &mut R) -> Self {
        let identity = IdentityKeyPair::generate(rng);
        Self {
            name,
            address: ProtocolAddress::new(name, 1),
            stores: ProtocolStores::new(identity, generate_registration_id(rng)),
        }
    }
}

pub fn run(options: &SimulationOptions, config: &SessionConfig) -> Result<SimulationReport> {
    config.validate()?;
    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut alice = Party::new("alice", &mut rng);
    let mut bob = Party::new("bob", &mut rng);

    // Bob publishes, Alice fetches through the directory encoding.
    let published = generate_prekeys(&mut bob.stores, 1, 1, 10, &mut rng)?;
    let fetched = decode_bundle(&encode_bundle(&published)?)?;
    establish_session(&mut alice.stores, &bob.address, &fetched, config)?;
    info!(
        rounds = options.rounds,
        per_round = options.messages_per_round,
        shuffle = options.shuffle,
        replay = options.replay,
        "session established, starting conversation"
    );

    let mut report = SimulationReport::default();
    for round in 0..options.rounds {
        exchange(&mut alice, &mut bob, round, options, config, &mut rng, &mut report)?;
        exchange(&mut bob, &mut alice, round, options, config, &mut rng, &mut report)?;
    }

    info!(
        sent = report.sent,
        decrypted = report.decrypted,
        replays_rejected = report.replays_rejected,
        failures = report.failures.len(),
        "simulation finished"
    );
    Ok(report)
}

fn exchange(
    sender: &mut Party,
    receiver: &mut Party,
    round: u32,
    options: &SimulationOptions,
    config: &SessionConfig,
    rng: &mut StdRng,
    report: &mut SimulationReport,
) -> Result<()> {
    let mut envelopes = Vec::with_capacity(options.messages_per_round as usize);
    {
        let mut cipher = SessionCipher::from_stores(receiver.address.clone(), &mut sender.stores, config.clone());
        for i in 0..options.messages_per_round {
            let text = format!("{} round {round} #{i}", sender.name);
            let message = cipher
                .encrypt(text.as_bytes())
                .with_context(|| format!("{} failed to encrypt", sender.name))?;
            envelopes.push((text, encode_envelope(&message)?));
            report.sent += 1;
        }
    }

    if options.shuffle {
        envelopes.shuffle(rng);
    }

    let mut wire = BytesMut::new();
    let mut expected = Vec::with_capacity(envelopes.len() + 1);
    for (text, envelope) in &envelopes {
        wire.extend_from_slice(envelope);
        expected.push(Some(text.clone()));
    }
    if options.replay {
        if let Some((_, envelope)) = envelopes.first() {
            wire.extend_from_slice(envelope);
            expected.push(None);
        }
    }

    let mut cipher = SessionCipher::from_stores(sender.address.clone(), &mut receiver.stores, config.clone());
    for want in expected {
        let Some(message) = try_decode_envelope(&mut wire)? else {
            report.failures.push("transport ended early".into());
            break;
        };
        match (cipher.decrypt(&message), want) {
            (Ok(plaintext), Some(text)) if plaintext == text.as_bytes() => {
                debug!(to = receiver.name, %text, "delivered");
                report.decrypted += 1;
            }
            (Ok(_), Some(text)) => report.failures.push(format!("garbled: {text}")),
            (Ok(_), None) => report.failures.push("replay was accepted".into()),
            (Err(SessionError::Message(MessageError::DuplicateMessage { .. })), None) => {
                report.replays_rejected += 1;
            }
            (Err(e), _) => {
                warn!(to = receiver.name, error = %e, "delivery failed");
                report.failures.push(e.to_string());
            }
        }
    }
    Ok(())
}
