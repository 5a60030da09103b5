//! Guest operations: result-record layouts, the error decoder, and the
//! public bridge facade.
//!
//! Record layouts are a binary ABI contract with the guest; offsets are
//! not self-describing and must match the guest binary exactly. A
//! non-zero error pointer supersedes every other field of a record.

use pgbridge_core::{Error, Result, RuntimeConfig, SqlError};

use crate::instance::GuestInstance;
use crate::memory::GuestAddr;
use crate::pool::Pool;
use crate::Runtime;

// Guest error record field offsets.
const ERR_MESSAGE: u32 = 0;
const ERR_FUNCNAME: u32 = 4;
const ERR_FILENAME: u32 = 8;
const ERR_LINENO: u32 = 12;
const ERR_CURSORPOS: u32 = 16;
const ERR_CONTEXT: u32 = 20;

/// An operation whose result record carries a result-string pointer.
struct StringOp {
    call: &'static str,
    free: &'static str,
    record_len: u32,
    str_off: u32,
    err_off: u32,
}

const PARSE: StringOp = StringOp {
    call: "pg_query_parse",
    free: "pg_query_free_parse_result",
    record_len: 12,
    str_off: 0,
    err_off: 8,
};

const NORMALIZE: StringOp = StringOp {
    call: "pg_query_normalize",
    free: "pg_query_free_normalize_result",
    record_len: 8,
    str_off: 0,
    err_off: 4,
};

const PARSE_PLPGSQL: StringOp = StringOp {
    call: "pg_query_parse_plpgsql",
    free: "pg_query_free_plpgsql_parse_result",
    record_len: 8,
    str_off: 0,
    err_off: 4,
};

const DEPARSE: StringOp = StringOp {
    call: "pg_query_deparse_protobuf",
    free: "pg_query_free_deparse_result",
    record_len: 8,
    str_off: 0,
    err_off: 4,
};

const FINGERPRINT_HEX: StringOp = StringOp {
    call: "pg_query_fingerprint",
    free: "pg_query_free_fingerprint_result",
    record_len: 20,
    str_off: 8,
    err_off: 16,
};

/// An operation whose result record carries a payload length and data
/// pointer (offset 0 length, 4 data, 12 error, 16 bytes total).
struct BytesOp {
    call: &'static str,
    free: &'static str,
}

const BYTES_RECORD_LEN: u32 = 16;
const BYTES_LEN_OFF: u32 = 0;
const BYTES_DATA_OFF: u32 = 4;
const BYTES_ERR_OFF: u32 = 12;

const PARSE_PROTOBUF: BytesOp = BytesOp {
    call: "pg_query_parse_protobuf",
    free: "pg_query_free_protobuf_parse_result",
};

const SCAN: BytesOp = BytesOp {
    call: "pg_query_scan",
    free: "pg_query_free_scan_result",
};

// Fingerprint record: 8-byte hash at 0, hex-string pointer at 8, error
// pointer at 16.
const FINGERPRINT_RECORD_LEN: u32 = 20;
const FINGERPRINT_HASH_OFF: u32 = 0;
const FINGERPRINT_ERR_OFF: u32 = 16;

/// Rebuild a structured error from the guest's fixed-offset error record.
///
/// Every string is copied out of guest memory here, strictly before the
/// owning result record is freed; freeing the record invalidates the
/// error record's backing memory.
fn decode_error(guest: &GuestInstance, err: GuestAddr) -> Result<SqlError> {
    Ok(SqlError {
        message: guest.read_c_string_at(err.offset(ERR_MESSAGE))?,
        funcname: guest.read_c_string_at(err.offset(ERR_FUNCNAME))?,
        filename: guest.read_c_string_at(err.offset(ERR_FILENAME))?,
        lineno: guest.read_u32(err.offset(ERR_LINENO))? as i32,
        cursorpos: guest.read_u32(err.offset(ERR_CURSORPOS))? as i32,
        context: guest.read_c_string_at(err.offset(ERR_CONTEXT))?,
    })
}

/// Combine an operation result with its cleanup result. The operation's
/// error (including a decoded parse error) takes precedence; a cleanup
/// failure after an otherwise successful call is itself a fault.
fn finish<T>(out: Result<T>, cleanup: Result<()>) -> Result<T> {
    match out {
        Err(err) => Err(err),
        Ok(value) => cleanup.map(|()| value),
    }
}

/// Run a guest call that fills a result record, releasing the record on
/// every exit path: the guest's own result-free export first, then the
/// record block itself.
fn run_record_op<T>(
    guest: &mut GuestInstance,
    call: &'static str,
    free: &'static str,
    record_len: u32,
    err_off: u32,
    arg: u64,
    decode: impl FnOnce(&mut GuestInstance, GuestAddr) -> Result<T>,
) -> Result<T> {
    let record = guest.malloc(record_len)?;

    let out = guest.call2(call, record.word(), arg).and_then(|_| {
        let err_ptr = guest.read_u32(record.offset(err_off))?;
        if err_ptr != 0 {
            let err = decode_error(guest, GuestAddr::new(err_ptr))?;
            return Err(Error::Sql(err));
        }
        decode(guest, record)
    });

    let cleanup = guest
        .call1(free, record.word())
        .map(|_| ())
        .and_then(|()| guest.free(record));
    finish(out, cleanup)
}

/// Marshal the input, run the operation, and release the input string on
/// every exit path.
fn run_string_op(guest: &mut GuestInstance, op: &StringOp, input: &[u8]) -> Result<String> {
    let input_str = guest.write_c_string(input)?;
    let out = run_record_op(
        guest,
        op.call,
        op.free,
        op.record_len,
        op.err_off,
        input_str.addr().word(),
        |guest, record| guest.read_c_string_at(record.offset(op.str_off)),
    );
    let cleanup = guest.free(input_str.addr());
    finish(out, cleanup)
}

fn run_bytes_op(guest: &mut GuestInstance, op: &BytesOp, input: &[u8]) -> Result<Vec<u8>> {
    let input_str = guest.write_c_string(input)?;
    let out = run_record_op(
        guest,
        op.call,
        op.free,
        BYTES_RECORD_LEN,
        BYTES_ERR_OFF,
        input_str.addr().word(),
        |guest, record| {
            let len = guest.read_u32(record.offset(BYTES_LEN_OFF))?;
            let data = guest.read_u32(record.offset(BYTES_DATA_OFF))?;
            guest.read_bytes(GuestAddr::new(data), len)
        },
    );
    let cleanup = guest.free(input_str.addr());
    finish(out, cleanup)
}

/// The public face of the sandboxed parser: a compiled guest module plus
/// an instance pool.
///
/// Each operation checks one instance out of the pool for the duration of
/// the call, so concurrent callers each execute against their own guest;
/// no instance is ever entered twice at once. An instance that produced
/// an infrastructure fault is discarded instead of being released.
pub struct Bridge {
    pool: Pool,
}

impl Bridge {
    /// Compile `guest_wasm` once and set up an instance pool over it.
    pub fn new(guest_wasm: &[u8]) -> Result<Self> {
        Self::with_config(guest_wasm, RuntimeConfig::default())
    }

    pub fn with_config(guest_wasm: &[u8], config: RuntimeConfig) -> Result<Self> {
        let runtime = Runtime::new(guest_wasm, config)?;
        Ok(Self {
            pool: Pool::new(runtime)?,
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn with_guest<T>(&self, f: impl FnOnce(&mut GuestInstance) -> Result<T>) -> Result<T> {
        let mut guest = self.pool.checkout()?;
        guest.begin_call();
        let out = f(&mut guest);
        if matches!(&out, Err(err) if err.is_fault()) {
            guest.discard();
        }
        out
    }

    /// Parse the given SQL statement into a parse tree (JSON format).
    pub fn parse_to_json(&self, input: &str) -> Result<String> {
        self.with_guest(|guest| run_string_op(guest, &PARSE, input.as_bytes()))
    }

    /// Parse the given SQL statement into a parse tree (protobuf format).
    pub fn parse_to_protobuf(&self, input: &str) -> Result<Vec<u8>> {
        self.with_guest(|guest| run_bytes_op(guest, &PARSE_PROTOBUF, input.as_bytes()))
    }

    /// Scan the given SQL statement into a protobuf token stream.
    pub fn scan_to_protobuf(&self, input: &str) -> Result<Vec<u8>> {
        self.with_guest(|guest| run_bytes_op(guest, &SCAN, input.as_bytes()))
    }

    /// Normalize the statement, replacing constant values with
    /// placeholders.
    pub fn normalize(&self, input: &str) -> Result<String> {
        self.with_guest(|guest| run_string_op(guest, &NORMALIZE, input.as_bytes()))
    }

    /// Deparse a protobuf-format parse tree back into a SQL statement.
    pub fn deparse_from_protobuf(&self, tree: &[u8]) -> Result<String> {
        self.with_guest(|guest| {
            let input_str = guest.write_c_string(tree)?;
            let out = (|guest: &mut GuestInstance| {
                // Deparse takes its input as an 8-byte {length, pointer}
                // parameter block in guest memory.
                let param = guest.malloc(8)?;
                let out = guest
                    .write_u32(param, input_str.len())
                    .and_then(|()| guest.write_u32(param.offset(4), input_str.addr().get()))
                    .and_then(|()| {
                        run_record_op(
                            guest,
                            DEPARSE.call,
                            DEPARSE.free,
                            DEPARSE.record_len,
                            DEPARSE.err_off,
                            param.word(),
                            |guest, record| guest.read_c_string_at(record.offset(DEPARSE.str_off)),
                        )
                    });
                let cleanup = guest.free(param);
                finish(out, cleanup)
            })(guest);
            let cleanup = guest.free(input_str.addr());
            finish(out, cleanup)
        })
    }

    /// Fingerprint the statement, returning the 64-bit hash.
    pub fn fingerprint_to_u64(&self, input: &str) -> Result<u64> {
        self.with_guest(|guest| {
            let input_str = guest.write_c_string(input.as_bytes())?;
            let out = run_record_op(
                guest,
                FINGERPRINT_HEX.call,
                FINGERPRINT_HEX.free,
                FINGERPRINT_RECORD_LEN,
                FINGERPRINT_ERR_OFF,
                input_str.addr().word(),
                |guest, record| guest.read_u64(record.offset(FINGERPRINT_HASH_OFF)),
            );
            let cleanup = guest.free(input_str.addr());
            finish(out, cleanup)
        })
    }

    /// Fingerprint the statement, returning the hash as a hex string.
    pub fn fingerprint_to_hex(&self, input: &str) -> Result<String> {
        self.with_guest(|guest| run_string_op(guest, &FINGERPRINT_HEX, input.as_bytes()))
    }

    /// Parse the given PL/pgSQL function statement into a parse tree
    /// (JSON format).
    pub fn parse_plpgsql_to_json(&self, input: &str) -> Result<String> {
        self.with_guest(|guest| run_string_op(guest, &PARSE_PLPGSQL, input.as_bytes()))
    }

    /// Run the guest's XXH3 hash (64-bit variant) over `input` with the
    /// given seed. Unlike the record-based operations the hash is the
    /// direct return value of the call.
    pub fn hash_xxh3_64(&self, input: &[u8], seed: u64) -> Result<u64> {
        self.with_guest(|guest| {
            let input_str = guest.write_c_string(input)?;
            let out = guest.call3(
                "XXH3_64bits_withSeed",
                input_str.addr().word(),
                input_str.len() as u64,
                seed,
            );
            let cleanup = guest.free(input_str.addr());
            finish(out, cleanup)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgbridge_core::Fault;

    #[test]
    fn test_record_layouts_match_abi() {
        // These offsets are a binary contract with the guest; a change
        // here must be matched by a guest rebuild.
        assert_eq!(PARSE.record_len, 12);
        assert_eq!(PARSE.err_off, 8);
        assert_eq!(BYTES_RECORD_LEN, 16);
        assert_eq!(BYTES_ERR_OFF, 12);
        assert_eq!(NORMALIZE.record_len, 8);
        assert_eq!(FINGERPRINT_RECORD_LEN, 20);
        assert_eq!(FINGERPRINT_HEX.str_off, 8);
        assert_eq!(ERR_CONTEXT, 20);
    }

    #[test]
    fn test_finish_precedence() {
        let out: Result<u32> = Ok(7);
        assert_eq!(finish(out, Ok(())).unwrap(), 7);

        // The operation's error wins over a cleanup failure.
        let out: Result<u32> = Err(Fault::Alloc(4).into());
        let cleanup: Result<()> = Err(Fault::Alloc(8).into());
        let err = finish(out, cleanup).unwrap_err();
        assert_eq!(err.to_string(), "guest allocator returned null for 4 bytes");

        // A cleanup failure on a successful call is reported.
        let out: Result<u32> = Ok(7);
        let cleanup: Result<()> = Err(Fault::Alloc(8).into());
        assert!(finish(out, cleanup).is_err());
    }
}
