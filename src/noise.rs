//! Noise_XX_25519_ChaChaPoly_BLAKE2b secure channel state machine (component 4.4).

use snow::{Builder, HandshakeState, TransportState};

use crate::error::{Error, Result};

const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2b";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

enum State {
    Uninit,
    HandshakeInProgress(Box<HandshakeState>),
    Transport(Box<TransportState>),
    Closed,
}

/// Per-connection Noise XX state machine. `start`/`process` drive the
/// three-message handshake; once `process` reports the handshake finished
/// the channel moves to transport and `encrypt`/`decrypt`/`rekey` become
/// available. Any cryptographic failure on a frame is fatal: the session
/// closes and must not be reused.
pub struct NoiseChannel {
    role: Role,
    state: State,
    remote_static: Option<[u8; 32]>,
    handshake_hash: Option<[u8; 32]>,
}

impl NoiseChannel {
    pub fn new() -> Self {
        Self { role: Role::Initiator, state: State::Uninit, remote_static: None, handshake_hash: None }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.state, State::Transport(_))
    }

    /// Begin the handshake as `role` using `static_priv` (32-byte X25519
    /// secret). The initiator's first message is returned; the responder
    /// returns `None` and waits for `process` to be called with message 1.
    pub fn start(&mut self, role: Role, static_priv: &[u8; 32]) -> Result<Option<Vec<u8>>> {
        let builder = Builder::new(NOISE_PARAMS.parse().map_err(|e| Error::crypto(format!("bad noise params: {e}")))?)
            .local_private_key(static_priv);

        self.role = role;
        match role {
            Role::Initiator => {
                let mut handshake = builder.build_initiator()?;
                let mut buf = vec![0u8; 256];
                let len = handshake.write_message(&[], &mut buf)?;
                buf.truncate(len);
                self.state = State::HandshakeInProgress(Box::new(handshake));
                Ok(Some(buf))
            }
            Role::Responder => {
                let handshake = builder.build_responder()?;
                self.state = State::HandshakeInProgress(Box::new(handshake));
                Ok(None)
            }
        }
    }

    /// Advance the handshake with an inbound frame, returning the next
    /// outbound frame (if any). Once the handshake finishes, the channel
    /// transitions to transport and captures the handshake hash and the
    /// peer's static public key.
    pub fn process(&mut self, msg: &[u8]) -> Result<Option<Vec<u8>>> {
        let State::HandshakeInProgress(mut handshake) = std::mem::replace(&mut self.state, State::Closed) else {
            self.state = State::Closed;
            return Err(Error::crypto("process called outside handshake_in_progress"));
        };

        let mut read_buf = vec![0u8; msg.len() + 256];
        let read_result = handshake.read_message(msg, &mut read_buf);
        if read_result.is_err() {
            self.state = State::Closed;
            return Err(Error::crypto("noise handshake message rejected"));
        }

        if handshake.is_handshake_finished() {
            self.finish_handshake(handshake)?;
            return Ok(None);
        }

        let mut write_buf = vec![0u8; 256];
        let write_result = handshake.write_message(&[], &mut write_buf);
        let out = match write_result {
            Ok(len) => {
                write_buf.truncate(len);
                Some(write_buf)
            }
            Err(_) => None,
        };

        let finished = handshake.is_handshake_finished();
        if finished {
            self.finish_handshake(handshake)?;
        } else {
            self.state = State::HandshakeInProgress(handshake);
        }
        Ok(out)
    }

    fn finish_handshake(&mut self, handshake: Box<HandshakeState>) -> Result<()> {
        let mut hash = [0u8; 32];
        let src = handshake.get_handshake_hash();
        let n = src.len().min(32);
        hash[..n].copy_from_slice(&src[..n]);
        self.handshake_hash = Some(hash);

        if let Some(rs) = handshake.get_remote_static() {
            let mut remote = [0u8; 32];
            remote.copy_from_slice(rs);
            self.remote_static = Some(remote);
        }

        let transport = handshake.into_transport_mode()?;
        self.state = State::Transport(Box::new(transport));
        Ok(())
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let State::Transport(transport) = &mut self.state else {
            return Err(Error::crypto("encrypt called outside transport state"));
        };
        let mut out = vec![0u8; plaintext.len() + 16];
        let len = transport.write_message(plaintext, &mut out).map_err(|e| {
            self.state = State::Closed;
            Error::Noise(e)
        })?;
        out.truncate(len);
        Ok(out)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let State::Transport(transport) = &mut self.state else {
            return Err(Error::crypto("decrypt called outside transport state"));
        };
        let mut out = vec![0u8; ciphertext.len()];
        let len = transport.read_message(ciphertext, &mut out).map_err(|_| {
            self.state = State::Closed;
            Error::crypto("noise transport decrypt failed")
        })?;
        out.truncate(len);
        Ok(out)
    }

    /// Refresh both send and receive cipher keys per the Noise rekey rule.
    pub fn rekey(&mut self) -> Result<()> {
        let State::Transport(transport) = &mut self.state else {
            return Err(Error::crypto("rekey called outside transport state"));
        };
        transport.rekey_outgoing();
        transport.rekey_incoming();
        Ok(())
    }

    pub fn handshake_hash(&self) -> Option<[u8; 32]> {
        self.handshake_hash
    }

    pub fn remote_static_key(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    pub fn close(&mut self) {
        self.state = State::Closed;
    }
}

impl Default for NoiseChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> [u8; 32] {
        let keypair = snow::Builder::new(NOISE_PARAMS.parse().unwrap()).generate_keypair().unwrap();
        let mut priv_key = [0u8; 32];
        priv_key.copy_from_slice(&keypair.private);
        priv_key
    }

    #[test]
    fn s4_noise_xx_mutual_authentication() {
        let initiator_priv = keypair();
        let responder_priv = keypair();

        let mut initiator = NoiseChannel::new();
        let mut responder = NoiseChannel::new();

        let msg1 = initiator.start(Role::Initiator, &initiator_priv).unwrap().unwrap();
        assert!(responder.start(Role::Responder, &responder_priv).unwrap().is_none());

        let msg2 = responder.process(&msg1).unwrap().unwrap();
        let msg3 = initiator.process(&msg2).unwrap().unwrap();
        assert!(responder.process(&msg3).unwrap().is_none());

        assert!(initiator.is_transport());
        assert!(responder.is_transport());
        assert_eq!(initiator.handshake_hash(), responder.handshake_hash());

        let initiator_static = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(initiator_priv));
        let responder_static = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(responder_priv));
        assert_eq!(responder.remote_static_key().unwrap(), initiator_static.to_bytes());
        assert_eq!(initiator.remote_static_key().unwrap(), responder_static.to_bytes());

        let ciphertext = initiator.encrypt(b"ping").unwrap();
        assert_eq!(responder.decrypt(&ciphertext).unwrap(), b"ping");

        let reply = responder.encrypt(b"pong").unwrap();
        assert_eq!(initiator.decrypt(&reply).unwrap(), b"pong");
    }

    #[test]
    fn encrypt_before_transport_fails() {
        let mut channel = NoiseChannel::new();
        assert!(channel.encrypt(b"x").is_err());
    }

    #[test]
    fn rekey_rotates_cipher_state() {
        let initiator_priv = keypair();
        let responder_priv = keypair();
        let mut initiator = NoiseChannel::new();
        let mut responder = NoiseChannel::new();

        let msg1 = initiator.start(Role::Initiator, &initiator_priv).unwrap().unwrap();
        responder.start(Role::Responder, &responder_priv).unwrap();
        let msg2 = responder.process(&msg1).unwrap().unwrap();
        let msg3 = initiator.process(&msg2).unwrap().unwrap();
        responder.process(&msg3).unwrap();

        initiator.rekey().unwrap();
        responder.rekey().unwrap();

        let ciphertext = initiator.encrypt(b"after rekey").unwrap();
        assert_eq!(responder.decrypt(&ciphertext).unwrap(), b"after rekey");
    }
}
