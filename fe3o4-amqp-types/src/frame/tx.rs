//! Transaction class methods (class id 90)

use bytes::BytesMut;

use crate::read::ReadBuffer;
use crate::Error;

use super::CLASS_TX;

/// Method id of tx.select
pub const SELECT: u16 = 10;
/// Method id of tx.select-ok
pub const SELECT_OK: u16 = 11;
/// Method id of tx.commit
pub const COMMIT: u16 = 20;
/// Method id of tx.commit-ok
pub const COMMIT_OK: u16 = 21;
/// Method id of tx.rollback
pub const ROLLBACK: u16 = 30;
/// Method id of tx.rollback-ok
pub const ROLLBACK_OK: u16 = 31;

/// A transaction class method; none carries arguments
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Method {
    Select,
    SelectOk,
    Commit,
    CommitOk,
    Rollback,
    RollbackOk,
}

impl Method {
    /// The method id within the transaction class
    pub fn method_id(&self) -> u16 {
        match self {
            Method::Select => SELECT,
            Method::SelectOk => SELECT_OK,
            Method::Commit => COMMIT,
            Method::CommitOk => COMMIT_OK,
            Method::Rollback => ROLLBACK,
            Method::RollbackOk => ROLLBACK_OK,
        }
    }

    pub(crate) fn decode(method_id: u16, _buffer: &mut ReadBuffer<'_>) -> Result<Method, Error> {
        match method_id {
            SELECT => Ok(Method::Select),
            SELECT_OK => Ok(Method::SelectOk),
            COMMIT => Ok(Method::Commit),
            COMMIT_OK => Ok(Method::CommitOk),
            ROLLBACK => Ok(Method::Rollback),
            ROLLBACK_OK => Ok(Method::RollbackOk),
            other => Err(Error::UnknownMethod(CLASS_TX, other)),
        }
    }

    pub(crate) fn encode(&self, _buf: &mut BytesMut) -> Result<(), Error> {
        Ok(())
    }
}
