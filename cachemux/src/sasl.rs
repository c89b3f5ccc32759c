//! SASL authentication frames. This crate only frames and correlates these
//! requests; it carries no SASL mechanism implementation of its own -- the
//! caller supplies already-encoded mechanism names and challenge responses
//! and interprets the continuation data itself.

use bytes::Bytes;
use std::time::Duration;

use crate::connection::Connection;
use crate::error::Error;
use crate::protocol::{Opcode, RequestFrame, Status};

#[derive(Debug)]
pub enum SaslOutcome {
    Authenticated,
    Continue(Bytes),
}

pub async fn list_mechs(conn: &mut Connection, deadline: Option<Duration>) -> Result<Vec<String>, Error> {
    let opaque = conn.next_opaque();
    let req = RequestFrame::new(Opcode::SaslListMechs, opaque);
    let resp = conn.roundtrip(&req, deadline, deadline).await?;
    if !resp.is_success() {
        return Err(Error::ServerStatus(resp.status()?));
    }
    let text = String::from_utf8_lossy(&resp.value);
    Ok(text.split_whitespace().map(|s| s.to_string()).collect())
}

pub async fn auth(
    conn: &mut Connection,
    mechanism: &str,
    initial_response: Bytes,
    deadline: Option<Duration>,
) -> Result<SaslOutcome, Error> {
    let opaque = conn.next_opaque();
    let req = RequestFrame::new(Opcode::SaslAuth, opaque)
        .with_key(Bytes::copy_from_slice(mechanism.as_bytes()))
        .with_value(initial_response);
    interpret(conn.roundtrip(&req, deadline, deadline).await?)
}

pub async fn step(
    conn: &mut Connection,
    mechanism: &str,
    challenge_response: Bytes,
    deadline: Option<Duration>,
) -> Result<SaslOutcome, Error> {
    let opaque = conn.next_opaque();
    let req = RequestFrame::new(Opcode::SaslStep, opaque)
        .with_key(Bytes::copy_from_slice(mechanism.as_bytes()))
        .with_value(challenge_response);
    interpret(conn.roundtrip(&req, deadline, deadline).await?)
}

fn interpret(resp: crate::protocol::ResponseFrame) -> Result<SaslOutcome, Error> {
    match resp.status()? {
        Status::NoError => Ok(SaslOutcome::Authenticated),
        Status::AuthenticationContinue => Ok(SaslOutcome::Continue(resp.value)),
        other => Err(Error::ServerStatus(other)),
    }
}
