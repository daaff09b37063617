//! session establishment: startup message, authentication and the parameter
//! exchange that precedes the first ready-for-query.

use fallible_iterator::FallibleIterator;
use postgres_protocol::{
    authentication::{self, sasl},
    message::{backend, frontend},
};

use super::{
    config::Config,
    error::{AuthenticationError, DbError, Error, SqlState},
    transaction::TransactionStatus,
    transport::Transport,
};

/// backend facts learned during the handshake. the process id / secret key
/// pair identifies the session for diagnostics and out of band cancellation.
pub struct SessionInfo {
    pub(crate) process_id: i32,
    pub(crate) secret_key: i32,
}

impl SessionInfo {
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }
}

#[cold]
#[inline(never)]
pub(crate) async fn startup(transport: &mut Transport, cfg: &Config) -> Result<SessionInfo, Error> {
    let mut params = vec![("client_encoding", "UTF8")];
    if let Some(user) = cfg.get_user() {
        params.push(("user", user));
    }
    if let Some(dbname) = cfg.get_dbname() {
        params.push(("database", dbname));
    }
    if let Some(options) = cfg.get_options() {
        params.push(("options", options));
    }
    if let Some(application_name) = cfg.get_application_name() {
        params.push(("application_name", application_name));
    }

    frontend::startup_message(params, &mut transport.write_buf)?;
    transport.send().await?;

    authenticate(transport, cfg).await?;

    let mut info = SessionInfo {
        process_id: 0,
        secret_key: 0,
    };

    loop {
        match transport.recv().await? {
            backend::Message::ReadyForQuery(body) => {
                debug_assert_eq!(TransactionStatus::from_status_byte(body.status()), TransactionStatus::Idle);
                return Ok(info);
            }
            backend::Message::BackendKeyData(body) => {
                info.process_id = body.process_id();
                info.secret_key = body.secret_key();
            }
            backend::Message::ParameterStatus(body) => {
                tracing::debug!(name = body.name()?, value = body.value()?, "backend parameter");
            }
            backend::Message::NoticeResponse(_) => {}
            backend::Message::ErrorResponse(body) => return Err(Error::db(&mut body.fields())),
            _ => return Err(Error::unexpected()),
        }
    }
}

async fn authenticate(transport: &mut Transport, cfg: &Config) -> Result<(), Error> {
    loop {
        match transport.recv().await? {
            backend::Message::AuthenticationOk => return Ok(()),
            backend::Message::AuthenticationCleartextPassword => {
                let pass = cfg.get_password().ok_or(AuthenticationError::MissingPassWord)?;
                send_pass(transport, pass).await?;
            }
            backend::Message::AuthenticationMd5Password(body) => {
                let pass = cfg.get_password().ok_or(AuthenticationError::MissingPassWord)?;
                let user = cfg
                    .get_user()
                    .ok_or(AuthenticationError::MissingUserName)?
                    .as_bytes();
                let pass = authentication::md5_hash(user, pass, body.salt());
                send_pass(transport, pass).await?;
            }
            backend::Message::AuthenticationSasl(body) => {
                let pass = cfg.get_password().ok_or(AuthenticationError::MissingPassWord)?;

                let mut has_scram = false;
                let mut mechanisms = body.mechanisms();
                while let Some(mechanism) = mechanisms.next()? {
                    if mechanism == sasl::SCRAM_SHA_256 {
                        has_scram = true;
                    }
                }
                if !has_scram {
                    return Err(AuthenticationError::UnsupportedMechanism.into());
                }

                let mut scram = sasl::ScramSha256::new(pass, sasl::ChannelBinding::unsupported());

                frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut transport.write_buf)?;
                transport.send().await?;

                match transport.recv().await? {
                    backend::Message::AuthenticationSaslContinue(body) => {
                        scram.update(body.data())?;
                        frontend::sasl_response(scram.message(), &mut transport.write_buf)?;
                        transport.send().await?;
                    }
                    backend::Message::ErrorResponse(body) => return Err(auth_error(body)),
                    _ => return Err(Error::unexpected()),
                }

                match transport.recv().await? {
                    backend::Message::AuthenticationSaslFinal(body) => scram.finish(body.data())?,
                    backend::Message::ErrorResponse(body) => return Err(auth_error(body)),
                    _ => return Err(Error::unexpected()),
                }
            }
            backend::Message::ErrorResponse(body) => return Err(auth_error(body)),
            backend::Message::NoticeResponse(_) => {}
            _ => return Err(Error::unexpected()),
        }
    }
}

async fn send_pass(transport: &mut Transport, pass: impl AsRef<[u8]>) -> Result<(), Error> {
    frontend::password_message(pass.as_ref(), &mut transport.write_buf)?;
    transport.send().await
}

fn auth_error(body: backend::ErrorResponseBody) -> Error {
    match DbError::parse(&mut body.fields()) {
        Ok(db) if *db.code() == SqlState::INVALID_PASSWORD => AuthenticationError::WrongPassWord.into(),
        Ok(db) => db.into(),
        Err(e) => e.into(),
    }
}
