// Handshake state machine: version and variant negotiation.
//
// Both ends run the same logic, parameterized by `Role`:
//
//   Idle ──hello()──▶ AwaitingPeerHello ──receive_hello()──▶ NegotiatingVersion
//                                              │                     │
//                                              ▼              receive_reply()
//                                            Failed ◀────────────────┤
//                                                                    ▼
//                                                                  Ready
//
// 1. Each side sends its Hello unconditionally, before reading anything, so
//    neither side can wait on the other to speak first.
// 2. On the peer's Hello, each side checks the magic, intersects the version
//    sets, and checks that every variant the server enables is supported by
//    the client. Failure ⇒ send InitFailed.
// 3. On success each side sends the highest common version as a one-bit
//    VersionChoice and compares it to the peer's.
//
// The transition methods are pure (no I/O) so every path of the machine can
// be tested directly; `run` drives them over a stream. Whatever happens, each
// side writes exactly one reply byte and reads exactly one reply byte after
// the Hellos, so neither side closes its socket with unread data pending.

use std::io::{Read, Write};

use tracing::{debug, warn};

use crate::error::{NegotiationFailure, ProtocolError, Result};
use crate::message::{Hello, NegotiationReply};
use crate::types::{Negotiated, ProtocolFamily, VariantFlags, VersionSet};

/// Which end of the connection a negotiator represents. The server's variant
/// flags decide the session's variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingPeerHello,
    NegotiatingVersion { version: u8, variants: VariantFlags },
    Ready(Negotiated),
    Failed(NegotiationFailure),
}

#[derive(Debug)]
pub struct HandshakeNegotiator {
    role: Role,
    family: ProtocolFamily,
    versions: VersionSet,
    variants: VariantFlags,
    state: HandshakeState,
}

impl HandshakeNegotiator {
    /// `versions` and `variants` are what this end supports (client) or
    /// enables (server). Bits this implementation does not know are kept in
    /// the Hello but never take part in the decision.
    pub fn new(
        role: Role,
        family: ProtocolFamily,
        versions: VersionSet,
        variants: VariantFlags,
    ) -> Self {
        Self {
            role,
            family,
            versions,
            variants,
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Produce this end's Hello. `Idle → AwaitingPeerHello`.
    pub fn hello(&mut self) -> Result<Hello> {
        self.expect_state("hello", matches!(self.state, HandshakeState::Idle))?;
        self.state = HandshakeState::AwaitingPeerHello;
        Ok(Hello {
            magic: self.family.magic(),
            versions: self.versions,
            variants: self.variants,
        })
    }

    /// Process the peer's Hello and return the reply to send.
    /// `AwaitingPeerHello → NegotiatingVersion | Failed`.
    pub fn receive_hello(&mut self, peer: &Hello) -> Result<NegotiationReply> {
        self.expect_state(
            "receive_hello",
            matches!(self.state, HandshakeState::AwaitingPeerHello),
        )?;
        match self.evaluate(peer) {
            Ok((version, variants)) => {
                self.state = HandshakeState::NegotiatingVersion { version, variants };
                Ok(NegotiationReply::VersionChoice(VersionSet::single(version)))
            }
            Err(failure) => {
                self.state = HandshakeState::Failed(failure);
                Ok(NegotiationReply::InitFailed)
            }
        }
    }

    /// Process the peer's reply. `NegotiatingVersion → Ready | Failed`.
    pub fn receive_reply(&mut self, reply: NegotiationReply) -> Result<Negotiated> {
        let HandshakeState::NegotiatingVersion { version, variants } = self.state else {
            return Err(self.wrong_state("receive_reply"));
        };
        let outcome = match reply {
            NegotiationReply::InitFailed => Err(NegotiationFailure::PeerRejected),
            NegotiationReply::VersionChoice(set) if set == VersionSet::single(version) => {
                Ok(Negotiated {
                    family: self.family,
                    version,
                    variants,
                })
            }
            NegotiationReply::VersionChoice(set) => Err(NegotiationFailure::VersionMismatch {
                expected: version,
                peer: set,
            }),
        };
        match outcome {
            Ok(negotiated) => {
                self.state = HandshakeState::Ready(negotiated);
                Ok(negotiated)
            }
            Err(failure) => {
                self.state = HandshakeState::Failed(failure.clone());
                Err(failure.into())
            }
        }
    }

    /// Run the whole handshake over a stream.
    pub fn run<R: Read, W: Write>(mut self, reader: &mut R, writer: &mut W) -> Result<Negotiated> {
        let hello = self.hello()?;
        hello.encode(writer)?;
        writer.flush()?;

        let peer = Hello::decode(reader)?;
        let reply = self.receive_hello(&peer)?;
        let sent = reply
            .encode(writer)
            .and_then(|()| writer.flush().map_err(ProtocolError::from));

        // Always consume the peer's reply byte, even on our own failure.
        let peer_reply = NegotiationReply::decode(reader);

        if let HandshakeState::Failed(failure) = &self.state {
            warn!(role = ?self.role, family = %self.family, reason = %failure, "handshake failed");
            return Err(failure.clone().into());
        }
        let peer_reply = peer_reply?;
        if let (Err(e), NegotiationReply::VersionChoice(_)) = (sent, peer_reply) {
            return Err(e);
        }
        match self.receive_reply(peer_reply) {
            Ok(negotiated) => {
                debug!(
                    role = ?self.role,
                    family = %negotiated.family,
                    version = negotiated.version,
                    variants = %negotiated.variants,
                    "handshake complete"
                );
                Ok(negotiated)
            }
            Err(e) => {
                warn!(role = ?self.role, error = %e, "handshake failed");
                Err(e)
            }
        }
    }

    fn evaluate(&self, peer: &Hello) -> std::result::Result<(u8, VariantFlags), NegotiationFailure> {
        let expected = self.family.magic();
        if peer.magic != expected {
            return Err(NegotiationFailure::BadMagic {
                expected,
                found: peer.magic,
            });
        }

        let common = self
            .versions
            .intersect(peer.versions)
            .intersect(VersionSet::SUPPORTED);
        let Some(version) = common.highest() else {
            return Err(NegotiationFailure::NoCommonVersion {
                local: self.versions,
                peer: peer.versions,
            });
        };

        let (server, client) = match self.role {
            Role::Server => (self.variants, peer.variants),
            Role::Client => (peer.variants, self.variants),
        };
        for flag in [VariantFlags::THREE_DIMENSIONS, VariantFlags::ADD_REMOVE] {
            if server.contains(flag) && !client.contains(flag) {
                return Err(NegotiationFailure::MissingVariant { flag });
            }
        }
        Ok((version, server.recognized()))
    }

    fn expect_state(&self, op: &str, ok: bool) -> Result<()> {
        if ok { Ok(()) } else { Err(self.wrong_state(op)) }
    }

    fn wrong_state(&self, op: &str) -> ProtocolError {
        ProtocolError::ProtocolViolation(format!("{op} called in handshake state {:?}", self.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, BufWriter};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn negotiator(role: Role, variants: VariantFlags) -> HandshakeNegotiator {
        HandshakeNegotiator::new(role, ProtocolFamily::Uamp, VersionSet::SUPPORTED, variants)
    }

    /// Drive two negotiators against each other without any I/O.
    fn negotiate_in_memory(
        mut server: HandshakeNegotiator,
        mut client: HandshakeNegotiator,
    ) -> (Result<Negotiated>, Result<Negotiated>) {
        let server_hello = server.hello().unwrap();
        let client_hello = client.hello().unwrap();
        let server_reply = server.receive_hello(&client_hello).unwrap();
        let client_reply = client.receive_hello(&server_hello).unwrap();
        let server_result = if let HandshakeState::Failed(f) = server.state() {
            Err(f.clone().into())
        } else {
            server.receive_reply(client_reply)
        };
        let client_result = if let HandshakeState::Failed(f) = client.state() {
            Err(f.clone().into())
        } else {
            client.receive_reply(server_reply)
        };
        (server_result, client_result)
    }

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn run_over(stream: TcpStream, negotiator: HandshakeNegotiator) -> Result<Negotiated> {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = BufWriter::new(stream);
        negotiator.run(&mut reader, &mut writer)
    }

    #[test]
    fn both_sides_agree_on_version_and_server_variants() {
        let server = negotiator(Role::Server, VariantFlags::THREE_DIMENSIONS);
        let client = negotiator(Role::Client, VariantFlags::KNOWN);
        let (s, c) = negotiate_in_memory(server, client);
        let (s, c) = (s.unwrap(), c.unwrap());
        assert_eq!(s, c);
        assert_eq!(s.version, 1);
        assert_eq!(s.variants, VariantFlags::THREE_DIMENSIONS);
    }

    #[test]
    fn highest_common_version_is_chosen_by_both() {
        // Peers advertising versions we do not know still agree on 1.
        let server = HandshakeNegotiator::new(
            Role::Server,
            ProtocolFamily::Uamp,
            VersionSet(0xE0),
            VariantFlags::NONE,
        );
        let client = HandshakeNegotiator::new(
            Role::Client,
            ProtocolFamily::Uamp,
            VersionSet(0xA0),
            VariantFlags::NONE,
        );
        let (s, c) = negotiate_in_memory(server, client);
        assert_eq!(s.unwrap().version, 1);
        assert_eq!(c.unwrap().version, 1);
    }

    #[test]
    fn reserved_variant_bits_are_ignored() {
        let server = negotiator(Role::Server, VariantFlags(0x0000_00FF));
        let client = negotiator(Role::Client, VariantFlags(0x0010_0000));
        let (s, c) = negotiate_in_memory(server, client);
        assert_eq!(s.unwrap().variants, VariantFlags::NONE);
        assert_eq!(c.unwrap().variants, VariantFlags::NONE);
    }

    #[test]
    fn client_extra_variants_are_not_enabled() {
        let server = negotiator(Role::Server, VariantFlags::NONE);
        let client = negotiator(Role::Client, VariantFlags::ADD_REMOVE);
        let (s, _) = negotiate_in_memory(server, client);
        assert!(!s.unwrap().variants.add_remove());
    }

    #[test]
    fn missing_add_remove_fails_on_both_sides() {
        let server = negotiator(Role::Server, VariantFlags::ADD_REMOVE);
        let client = negotiator(Role::Client, VariantFlags::NONE);
        let (s, c) = negotiate_in_memory(server, client);
        for result in [s, c] {
            match result {
                Err(ProtocolError::NegotiationFailed(NegotiationFailure::MissingVariant {
                    flag,
                })) => assert_eq!(flag, VariantFlags::ADD_REMOVE),
                other => panic!("expected MissingVariant, got {other:?}"),
            }
        }
    }

    #[test]
    fn missing_three_dimensions_fails() {
        let server = negotiator(Role::Server, VariantFlags::THREE_DIMENSIONS);
        let client = negotiator(Role::Client, VariantFlags::ADD_REMOVE);
        let (s, c) = negotiate_in_memory(server, client);
        assert!(s.is_err() && c.is_err());
    }

    #[test]
    fn bad_magic_fails() {
        let mut server = negotiator(Role::Server, VariantFlags::NONE);
        server.hello().unwrap();
        let reply = server
            .receive_hello(&Hello {
                magic: *b"HTTP",
                versions: VersionSet::SUPPORTED,
                variants: VariantFlags::NONE,
            })
            .unwrap();
        assert_eq!(reply, NegotiationReply::InitFailed);
        assert!(matches!(
            server.state(),
            HandshakeState::Failed(NegotiationFailure::BadMagic { .. })
        ));
    }

    #[test]
    fn family_mismatch_fails() {
        let server = negotiator(Role::Server, VariantFlags::NONE);
        let client = HandshakeNegotiator::new(
            Role::Client,
            ProtocolFamily::Mvisp,
            VersionSet::SUPPORTED,
            VariantFlags::NONE,
        );
        let (s, c) = negotiate_in_memory(server, client);
        assert!(s.is_err() && c.is_err());
    }

    #[test]
    fn disjoint_versions_fail() {
        let mut client = negotiator(Role::Client, VariantFlags::NONE);
        client.hello().unwrap();
        let reply = client
            .receive_hello(&Hello {
                magic: *b"UAMP",
                versions: VersionSet(0x40),
                variants: VariantFlags::NONE,
            })
            .unwrap();
        assert_eq!(reply, NegotiationReply::InitFailed);
        assert!(matches!(
            client.state(),
            HandshakeState::Failed(NegotiationFailure::NoCommonVersion { .. })
        ));
    }

    #[test]
    fn mismatched_version_choice_fails() {
        let mut client = negotiator(Role::Client, VariantFlags::NONE);
        let hello = client.hello().unwrap();
        client.receive_hello(&hello).unwrap();
        let err = client
            .receive_reply(NegotiationReply::VersionChoice(VersionSet(0x40)))
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::NegotiationFailed(NegotiationFailure::VersionMismatch { .. })
        ));
    }

    #[test]
    fn init_failed_reply_is_peer_rejection() {
        let mut client = negotiator(Role::Client, VariantFlags::NONE);
        let hello = client.hello().unwrap();
        client.receive_hello(&hello).unwrap();
        let err = client.receive_reply(NegotiationReply::InitFailed).unwrap_err();
        assert!(err.is_refusal());
        assert!(matches!(
            client.state(),
            HandshakeState::Failed(NegotiationFailure::PeerRejected)
        ));
    }

    #[test]
    fn transitions_out_of_order_are_violations() {
        let mut n = negotiator(Role::Client, VariantFlags::NONE);
        assert!(matches!(
            n.receive_reply(NegotiationReply::InitFailed),
            Err(ProtocolError::ProtocolViolation(_))
        ));
        n.hello().unwrap();
        assert!(matches!(n.hello(), Err(ProtocolError::ProtocolViolation(_))));
    }

    #[test]
    fn run_over_tcp_succeeds() {
        let (client_stream, server_stream) = tcp_pair();
        let server = thread::spawn(move || {
            run_over(
                server_stream,
                negotiator(Role::Server, VariantFlags::ADD_REMOVE),
            )
        });
        let client = run_over(client_stream, negotiator(Role::Client, VariantFlags::KNOWN));
        let server = server.join().unwrap();
        assert_eq!(client.unwrap(), server.unwrap());
    }

    #[test]
    fn run_over_tcp_failure_exchanges_only_init_failed() {
        let (client_stream, server_stream) = tcp_pair();
        let server = thread::spawn(move || {
            run_over(
                server_stream,
                negotiator(Role::Server, VariantFlags::ADD_REMOVE),
            )
        });

        // A raw client that records exactly what the server sends.
        let mut raw = client_stream;
        let hello = Hello {
            magic: *b"UAMP",
            versions: VersionSet::SUPPORTED,
            variants: VariantFlags::NONE,
        };
        hello.encode(&mut raw).unwrap();
        let mut server_hello = [0u8; 9];
        raw.read_exact(&mut server_hello).unwrap();
        raw.write_all(&[0x00]).unwrap();
        let mut reply = Vec::new();
        raw.read_to_end(&mut reply).unwrap();

        assert_eq!(&server_hello[..4], b"UAMP");
        assert_eq!(reply, vec![0x00], "server must send InitFailed and nothing else");
        let err = server.join().unwrap().unwrap_err();
        assert!(err.is_refusal());
    }
}
