//! Persisted values
//!
//! A compact tag-prefixed stream: one ASCII tag byte per value, fixed-width
//! little-endian scalars, 4-byte lengths. Bytecode lambdas serialize their
//! metadata, constant pool and instruction stream; native lambdas and the
//! runtime-only object kinds (fibers, channels, modules, types) do not
//! encode.

use crate::dict::Dict;
use crate::intern::unintern;
use crate::lambda::{Chunk, Code, Lambda};
use crate::object::Payload;
use crate::value::Value;
use crate::vector::PersistentVec;
use std::io::{Read, Write};
use std::sync::Arc;

pub type EncodeResult = Result<(), String>;

fn io_err(e: std::io::Error) -> String {
    format!("serialization-error: io failure: {e}")
}

fn write_len(w: &mut impl Write, len: usize) -> EncodeResult {
    let len: i32 = len
        .try_into()
        .map_err(|_| "serialization-error: length exceeds 32 bits".to_string())?;
    w.write_all(&len.to_le_bytes()).map_err(io_err)
}

fn write_str(w: &mut impl Write, tag: u8, s: &str) -> EncodeResult {
    w.write_all(&[tag]).map_err(io_err)?;
    write_len(w, s.len())?;
    w.write_all(s.as_bytes()).map_err(io_err)
}

pub fn encode(w: &mut impl Write, value: &Value) -> EncodeResult {
    match value {
        Value::Int(n) => {
            w.write_all(b"i").map_err(io_err)?;
            w.write_all(&n.to_le_bytes()).map_err(io_err)
        }
        Value::Float(f) => {
            w.write_all(b"f").map_err(io_err)?;
            w.write_all(&f.to_le_bytes()).map_err(io_err)
        }
        Value::Ptr(_) => Err("serialization-error: cannot encode raw pointer".to_string()),
        Value::Obj(None) => w.write_all(b"n").map_err(io_err),
        Value::Obj(Some(o)) => match &o.payload {
            Payload::Str(s) => write_str(w, b's', s),
            Payload::Symbol(id) => write_str(w, b'r', &unintern(*id)),
            Payload::Keyword(id) => write_str(w, b'k', &unintern(*id)),
            Payload::List { first, rest } => {
                w.write_all(b"c").map_err(io_err)?;
                encode(w, first)?;
                encode(w, rest)
            }
            Payload::Vector(v) => {
                w.write_all(b"v").map_err(io_err)?;
                write_len(w, v.len())?;
                for item in v.iter() {
                    encode(w, item)?;
                }
                Ok(())
            }
            Payload::Dict(d) => {
                let d = d.lock().expect("dict poisoned");
                w.write_all(b"d").map_err(io_err)?;
                write_len(w, d.len())?;
                for (k, v) in d.iter() {
                    encode(w, k)?;
                    encode(w, v)?;
                }
                Ok(())
            }
            Payload::Lambda(l) => {
                let l = l.lock().expect("lambda poisoned");
                encode_lambda(w, &l)
            }
            other => Err(format!(
                "serialization-error: cannot encode {}",
                match other {
                    Payload::Module(_) => "module",
                    Payload::Channel(_) => "channel",
                    Payload::Fiber(_) => "fiber",
                    Payload::Type(_) => "type",
                    _ => "object",
                }
            )),
        },
    }
}

fn encode_lambda(w: &mut impl Write, l: &Lambda) -> EncodeResult {
    let chunk = match &l.code {
        Code::Chunk(c) => c,
        Code::Native(..) => {
            return Err("serialization-error: unable to serialize non-bytecode function".to_string());
        }
    };
    w.write_all(b"l").map_err(io_err)?;
    encode(w, &l.name)?;
    encode(w, &l.defining)?;
    w.write_all(&(l.arg_index as i32).to_le_bytes()).map_err(io_err)?;
    w.write_all(&(l.argc as i32).to_le_bytes()).map_err(io_err)?;
    w.write_all(&[l.vararg as u8]).map_err(io_err)?;
    write_len(w, chunk.consts.len())?;
    for c in &chunk.consts {
        encode(w, c)?;
    }
    w.write_all(&(chunk.code.len() as i64).to_le_bytes())
        .map_err(io_err)?;
    w.write_all(&(chunk.stack_size as i32).to_le_bytes())
        .map_err(io_err)?;
    w.write_all(&(l.closure_size as i32).to_le_bytes())
        .map_err(io_err)?;
    w.write_all(&chunk.code).map_err(io_err)
}

fn read_exact<const N: usize>(r: &mut impl Read) -> Result<[u8; N], String> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)
        .map_err(|_| "serialization-error: truncated stream".to_string())?;
    Ok(buf)
}

fn read_i32(r: &mut impl Read) -> Result<i32, String> {
    Ok(i32::from_le_bytes(read_exact::<4>(r)?))
}

fn read_i64(r: &mut impl Read) -> Result<i64, String> {
    Ok(i64::from_le_bytes(read_exact::<8>(r)?))
}

fn read_string(r: &mut impl Read) -> Result<String, String> {
    let len = read_i32(r)?;
    if len < 0 {
        return Err("serialization-error: negative length".to_string());
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)
        .map_err(|_| "serialization-error: truncated stream".to_string())?;
    String::from_utf8(buf).map_err(|_| "serialization-error: invalid utf-8".to_string())
}

pub fn decode(r: &mut impl Read) -> Result<Value, String> {
    let tag = read_exact::<1>(r)?[0];
    match tag {
        b'i' => Ok(Value::Int(read_i64(r)?)),
        b'f' => Ok(Value::Float(f64::from_le_bytes(read_exact::<8>(r)?))),
        b'n' => Ok(Value::nil()),
        b's' => Ok(Value::string(read_string(r)?)),
        b'r' => Ok(Value::symbol(&read_string(r)?)),
        b'k' => Ok(Value::keyword(&read_string(r)?)),
        b'c' => {
            let first = decode(r)?;
            let rest = decode(r)?;
            Ok(Value::cons(first, rest))
        }
        b'v' => {
            let len = read_i32(r)?;
            let mut v = PersistentVec::new();
            for _ in 0..len {
                v = v.push(decode(r)?);
            }
            Ok(Value::vector(v))
        }
        b'd' => {
            let len = read_i32(r)?;
            let mut d = Dict::new();
            for _ in 0..len {
                let k = decode(r)?;
                let v = decode(r)?;
                d.set(k, v);
            }
            Ok(Value::dict(d))
        }
        b'l' => decode_lambda(r),
        other => Err(format!(
            "serialization-error: unknown tag byte {other:#x}"
        )),
    }
}

fn decode_lambda(r: &mut impl Read) -> Result<Value, String> {
    let name = decode(r)?;
    let defining = decode(r)?;
    let arg_index = read_i32(r)?;
    let argc = read_i32(r)?;
    let vararg = read_exact::<1>(r)?[0] != 0;
    let const_count = read_i32(r)?;
    let mut consts = Vec::new();
    for _ in 0..const_count {
        consts.push(decode(r)?);
    }
    let code_size = read_i64(r)?;
    if code_size < 0 {
        return Err("serialization-error: negative code size".to_string());
    }
    let stack_size = read_i32(r)?;
    let closure_size = read_i32(r)?;
    let mut code = vec![0u8; code_size as usize];
    r.read_exact(&mut code)
        .map_err(|_| "serialization-error: truncated bytecode".to_string())?;

    let mut chunk = Chunk {
        code,
        consts,
        stack_size: stack_size.max(0) as u32,
        prelude_end: 0,
    };
    chunk.scan_prelude();

    let mut lambda = Lambda::from_chunk(Arc::new(chunk));
    lambda.name = name;
    lambda.defining = defining;
    lambda.arg_index = arg_index.max(0) as u32;
    lambda.argc = argc.max(0) as u32;
    lambda.vararg = vararg;
    lambda.closure_size = closure_size.max(0) as u32;
    Ok(Value::lambda(lambda))
}

/// Convenience wrappers over byte buffers.
pub fn encode_to_vec(value: &Value) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    encode(&mut out, value)?;
    Ok(out)
}

pub fn decode_from_slice(bytes: &[u8]) -> Result<Value, String> {
    decode(&mut &bytes[..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lambda::Op;

    fn roundtrip(v: &Value) -> Value {
        decode_from_slice(&encode_to_vec(v).unwrap()).unwrap()
    }

    #[test]
    fn scalars_roundtrip() {
        for v in [
            Value::Int(0),
            Value::Int(i64::MIN),
            Value::Int(i64::MAX),
            Value::Float(2.5),
            Value::Float(-0.0),
            Value::nil(),
        ] {
            assert_eq!(roundtrip(&v), v);
        }
    }

    #[test]
    fn strings_symbols_keywords_roundtrip() {
        assert_eq!(roundtrip(&Value::string("héllo")), Value::string("héllo"));
        assert_eq!(roundtrip(&Value::symbol("sym")), Value::symbol("sym"));
        assert_eq!(roundtrip(&Value::keyword(":kw")), Value::keyword(":kw"));
    }

    #[test]
    fn aggregates_roundtrip() {
        let list = Value::list_from(&[
            Value::Int(1),
            Value::string("two"),
            Value::list_from(&[Value::symbol("three")]),
        ]);
        assert_eq!(roundtrip(&list), list);

        let vec = Value::vector(PersistentVec::from_slice(&[
            Value::Int(1),
            Value::Float(2.0),
        ]));
        assert_eq!(roundtrip(&vec), vec);

        let mut d = Dict::new();
        d.set(Value::keyword(":a"), Value::Int(1));
        d.set(Value::string("b"), Value::nil());
        let dict = Value::dict(d);
        assert_eq!(roundtrip(&dict), dict);
    }

    #[test]
    fn dotted_pair_roundtrips() {
        let pair = Value::cons(Value::Int(1), Value::Int(2));
        assert_eq!(roundtrip(&pair), pair);
    }

    #[test]
    fn lambda_roundtrips_structurally() {
        let mut chunk = Chunk::new();
        chunk.emit(Op::MakeClosure);
        chunk.emit(Op::ArgPop);
        chunk.emit_u64(0);
        chunk.emit(Op::Int);
        chunk.emit_i64(7);
        chunk.emit(Op::Return);
        chunk.stack_size = 4;
        chunk.prelude_end = 10;
        chunk.consts.push(Value::symbol("k"));
        let mut l = Lambda::from_chunk(Arc::new(chunk));
        l.argc = 1;
        l.closure_size = 3;
        l.name = Value::symbol("seven");

        let v = Value::lambda(l);
        let back = roundtrip(&v);
        let obj = back.as_obj().unwrap();
        let got = obj.as_lambda().unwrap().lock().unwrap();
        assert_eq!(got.argc, 1);
        assert_eq!(got.closure_size, 3);
        assert!(!got.vararg);
        assert_eq!(got.name, Value::symbol("seven"));
        let chunk = got.chunk().unwrap();
        assert_eq!(chunk.stack_size, 4);
        // prelude recomputed from the MAKE_CLOSURE / ARG_POP prefix
        assert_eq!(chunk.prelude_end, 10);
        assert_eq!(chunk.consts, vec![Value::symbol("k")]);
    }

    #[test]
    fn native_lambda_does_not_encode() {
        fn f(
            _: &[Value],
            _: &mut crate::lambda::CallContext,
        ) -> Result<crate::lambda::Control, Value> {
            Ok(crate::lambda::Control::Value(Value::nil()))
        }
        let err = encode_to_vec(&Value::native("f", f)).unwrap_err();
        assert!(err.contains("non-bytecode"));
    }

    #[test]
    fn truncated_stream_errors() {
        let bytes = encode_to_vec(&Value::Int(5)).unwrap();
        let err = decode_from_slice(&bytes[..4]).unwrap_err();
        assert!(err.contains("truncated"));
    }

    #[test]
    fn unknown_tag_errors() {
        assert!(decode_from_slice(b"z").unwrap_err().contains("unknown tag"));
    }
}
