//! Shared helpers for the scenario tests: tenant configs and assembled
//! guest programs.

use std::sync::Arc;

use fccore::program::{ProgramInstance, ProgramSource};
use fccore::settings::ProgramEntry;
use fccore::syscalls::nr;
use fccore::tenant::{TenantConfig, TenantGroup};
use fccore::BinaryStorage;
use fcvm::asm::{Asm, Label, Reg};

pub const BASE: u64 = 0x400000;
pub const TEXT_PLAIN: &str = "text/plain";

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config(name: &str, mutate: impl FnOnce(&mut TenantGroup)) -> Arc<TenantConfig> {
    let mut group = TenantGroup::new("test");
    mutate(&mut group);
    Arc::new(TenantConfig::new(name.to_string(), String::new(), String::new(), group, String::new()))
}

pub fn launch_single(
    config: &Arc<TenantConfig>,
    request: Vec<u8>,
) -> Arc<ProgramInstance> {
    let source = ProgramSource::Binaries {
        request: BinaryStorage::from_bytes(request),
        storage: BinaryStorage::empty(),
    };
    ProgramInstance::launch(config.clone(), source, false)
}

pub fn launch_with_storage(
    config: &Arc<TenantConfig>,
    request: Vec<u8>,
    storage: Vec<u8>,
) -> Arc<ProgramInstance> {
    let source = ProgramSource::Binaries {
        request: BinaryStorage::from_bytes(request),
        storage: BinaryStorage::from_bytes(storage),
    };
    ProgramInstance::launch(config.clone(), source, false)
}

/// Emit boot code registering `entries` and halting in wait_for_requests.
pub fn emit_boot(a: &mut Asm, entries: &[(ProgramEntry, Label)]) {
    for (entry, label) in entries {
        a.movi(Reg::Rdi, *entry as usize as u64);
        a.movi_label(Reg::Rsi, *label);
        a.sys(nr::REGISTER_FUNC);
    }
    a.sys(nr::WAIT_FOR_REQUESTS);
}

/// Emit a buffered-response epilogue. Expects the body address in R10 and
/// its length in R11; clobbers the argument registers.
pub fn emit_respond(a: &mut Asm, status: u16, ctype: Label, ctype_len: u64) {
    a.mov(Reg::Rcx, Reg::R10);
    a.mov(Reg::R8, Reg::R11);
    a.movi(Reg::Rdi, status as u64);
    a.movi_label(Reg::Rsi, ctype);
    a.movi(Reg::Rdx, ctype_len);
    a.movi(Reg::R9, 0);
    a.sys(nr::BACKEND_RESPONSE);
}

/// Guest answering every GET with a fixed status/content-type/body.
pub fn static_get_guest(status: u16, ctype: &str, body: &[u8]) -> Vec<u8> {
    let mut a = Asm::new(BASE);
    let boot = a.here();
    let get_fn = a.forward();
    emit_boot(&mut a, &[(ProgramEntry::BackendGet, get_fn)]);

    a.bind(get_fn);
    let ctype_l = a.forward();
    let body_l = a.forward();
    a.movi_label(Reg::R10, body_l);
    a.movi(Reg::R11, body.len() as u64);
    emit_respond(&mut a, status, ctype_l, ctype.len() as u64);

    a.bind(ctype_l);
    let _ = a.db(ctype.as_bytes());
    a.bind(body_l);
    let _ = a.db(body);
    a.into_elf(boot)
}

/// Guest echoing the POST body with the given status.
pub fn post_echo_guest(status: u16, ctype: &str) -> Vec<u8> {
    let mut a = Asm::new(BASE);
    let boot = a.here();
    let post_fn = a.forward();
    emit_boot(&mut a, &[(ProgramEntry::BackendPost, post_fn)]);

    // on_post(url, arg, ctype, data, len)
    a.bind(post_fn);
    let ctype_l = a.forward();
    a.mov(Reg::R10, Reg::Rcx);
    a.mov(Reg::R11, Reg::R8);
    emit_respond(&mut a, status, ctype_l, ctype.len() as u64);
    a.bind(ctype_l);
    let _ = a.db(ctype.as_bytes());
    a.into_elf(boot)
}

/// Guest whose GET spins forever; its error callback substitutes a fixed
/// response.
pub fn spin_with_error_guest(err_status: u16, err_body: &[u8]) -> Vec<u8> {
    let mut a = Asm::new(BASE);
    let boot = a.here();
    let get_fn = a.forward();
    let err_fn = a.forward();
    emit_boot(&mut a, &[(ProgramEntry::BackendGet, get_fn), (ProgramEntry::BackendError, err_fn)]);

    a.bind(get_fn);
    let spin = a.here();
    a.jmp(spin);

    a.bind(err_fn);
    let ctype_l = a.forward();
    let body_l = a.forward();
    a.movi_label(Reg::R10, body_l);
    a.movi(Reg::R11, err_body.len() as u64);
    emit_respond(&mut a, err_status, ctype_l, TEXT_PLAIN.len() as u64);

    a.bind(ctype_l);
    let _ = a.db(TEXT_PLAIN.as_bytes());
    a.bind(body_l);
    let _ = a.db(err_body);
    a.into_elf(boot)
}

/// Guest whose GET faults once (then spins into a timeout) and responds
/// '9' on any later call that sees leftover state. With working resets
/// every call times out; a broken reset would answer 200.
pub fn poison_then_tell_guest() -> Vec<u8> {
    let mut a = Asm::new(BASE);
    let boot = a.here();
    let get_fn = a.forward();
    emit_boot(&mut a, &[(ProgramEntry::BackendGet, get_fn)]);

    a.bind(get_fn);
    let cell = a.forward();
    let ctype_l = a.forward();
    let respond = a.forward();
    a.movi_label(Reg::R10, cell);
    a.ldw(Reg::R11, Reg::R10, 0);
    a.jnz(Reg::R11, respond);
    a.movi(Reg::R11, 1);
    a.stw(Reg::R10, Reg::R11, 0);
    let spin = a.here();
    a.jmp(spin);

    a.bind(respond);
    a.movi(Reg::Rax, b'9' as u64);
    a.stb(Reg::R10, Reg::Rax, 8);
    a.mov(Reg::R11, Reg::R10);
    a.addi(Reg::R11, 8);
    a.mov(Reg::R10, Reg::R11);
    a.movi(Reg::R11, 1);
    emit_respond(&mut a, 200, ctype_l, TEXT_PLAIN.len() as u64);

    a.bind(cell);
    let _ = a.db(&[0u8; 16]);
    a.bind(ctype_l);
    let _ = a.db(TEXT_PLAIN.as_bytes());
    a.into_elf(boot)
}

/// Guest returning the previous value of a private cell (as one ASCII
/// digit) and then scribbling on it. Fresh state answers '0'. With
/// `opt_out_of_ephemeral` the boot code asks to be kept warm.
pub fn scribble_guest(opt_out_of_ephemeral: bool) -> Vec<u8> {
    let mut a = Asm::new(BASE);
    let boot = a.here();
    let get_fn = a.forward();
    if opt_out_of_ephemeral {
        a.movi(Reg::Rdi, 0);
        a.sys(nr::MAKE_EPHEMERAL);
    }
    emit_boot(&mut a, &[(ProgramEntry::BackendGet, get_fn)]);

    a.bind(get_fn);
    let cell = a.forward();
    let ctype_l = a.forward();
    a.movi_label(Reg::R10, cell);
    a.ldw(Reg::R11, Reg::R10, 0);
    a.movi(Reg::R9, b'0' as u64);
    a.add(Reg::R9, Reg::R11);
    a.stb(Reg::R10, Reg::R9, 8);
    // scribble for the next request to (maybe) see
    a.addi(Reg::R11, 1);
    a.stw(Reg::R10, Reg::R11, 0);
    a.addi(Reg::R10, 8);
    a.movi(Reg::R11, 1);
    emit_respond(&mut a, 200, ctype_l, TEXT_PLAIN.len() as u64);

    a.bind(cell);
    let _ = a.db(&[0u8; 16]);
    a.bind(ctype_l);
    let _ = a.db(TEXT_PLAIN.as_bytes());
    a.into_elf(boot)
}

/// Guest whose GET pauses for `ms` and then answers 200 "ok".
pub fn sleepy_guest(ms: u32) -> Vec<u8> {
    let mut a = Asm::new(BASE);
    let boot = a.here();
    let get_fn = a.forward();
    emit_boot(&mut a, &[(ProgramEntry::BackendGet, get_fn)]);

    a.bind(get_fn);
    let ctype_l = a.forward();
    let body_l = a.forward();
    a.pause_ms(ms);
    a.movi_label(Reg::R10, body_l);
    a.movi(Reg::R11, 2);
    emit_respond(&mut a, 200, ctype_l, TEXT_PLAIN.len() as u64);
    a.bind(ctype_l);
    let _ = a.db(TEXT_PLAIN.as_bytes());
    a.bind(body_l);
    let _ = a.db(b"ok");
    a.into_elf(boot)
}

/// Guest streaming the digits 0..9, one byte per callback.
pub fn streaming_guest() -> Vec<u8> {
    let mut a = Asm::new(BASE);
    let boot = a.here();
    let get_fn = a.forward();
    emit_boot(&mut a, &[(ProgramEntry::BackendGet, get_fn)]);

    a.bind(get_fn);
    let ctype_l = a.forward();
    let sbuf = a.forward();
    let cb = a.forward();
    a.movi(Reg::Rdi, 200);
    a.movi_label(Reg::Rsi, ctype_l);
    a.movi(Reg::Rdx, TEXT_PLAIN.len() as u64);
    a.movi(Reg::Rcx, 10); // content-length
    a.movi_label(Reg::R8, cb);
    a.movi_label(Reg::R9, sbuf);
    a.sys(nr::BACKEND_STREAMING_RESPONSE);

    // cb(arg=buffer, max_len, written, total): one digit per call,
    // chunk pointer back in rdi, length in rdx
    a.bind(cb);
    a.movi(Reg::R10, b'0' as u64);
    a.add(Reg::R10, Reg::Rdx);
    a.stb(Reg::Rdi, Reg::R10, 0);
    a.movi(Reg::Rdx, 1);
    a.ret();

    a.bind(ctype_l);
    let _ = a.db(TEXT_PLAIN.as_bytes());
    a.bind(sbuf);
    let _ = a.db(&[0u8; 16]);
    a.into_elf(boot)
}

/// Dual-role guest for the storage scenarios. Booted as the storage VM it
/// registers the live-update callbacks and serves a counter; booted as the
/// request VM it answers GET by calling into storage and rendering
/// `counter * multiplier` as ASCII.
///
/// `increment` selects whether the storage call bumps the counter before
/// returning it (the pre-update program) or just reads it (post-update).
pub fn counter_guest(multiplier: u32, increment: bool) -> Vec<u8> {
    let mut a = Asm::new(BASE);
    let boot = a.here();
    let get_fn = a.forward();
    let storage_boot = a.forward();
    let storage_fn = a.forward();
    let ser_fn = a.forward();
    let deser_fn = a.forward();
    let cell = a.forward();
    let buf = a.forward();
    let ctype_l = a.forward();

    // boot: branch on role
    a.sys(nr::IS_STORAGE);
    a.jnz(Reg::Rax, storage_boot);
    emit_boot(&mut a, &[(ProgramEntry::BackendGet, get_fn)]);

    a.bind(storage_boot);
    a.movi(Reg::Rdi, ProgramEntry::LiveupdSerialize as usize as u64);
    a.movi_label(Reg::Rsi, ser_fn);
    a.sys(nr::REGISTER_FUNC);
    a.movi(Reg::Rdi, ProgramEntry::LiveupdDeserialize as usize as u64);
    a.movi_label(Reg::Rsi, deser_fn);
    a.sys(nr::REGISTER_FUNC);
    a.movi_label(Reg::Rdi, storage_fn);
    a.sys(nr::STORAGE_ALLOW);
    a.sys(nr::WAIT_FOR_REQUESTS);

    // storage_fn(n, descriptors, dst_cap): counter op, returns 4 bytes
    a.bind(storage_fn);
    a.movi_label(Reg::R10, cell);
    if increment {
        a.ldw(Reg::R11, Reg::R10, 0);
        a.addi(Reg::R11, 1);
        a.stw(Reg::R10, Reg::R11, 0);
    }
    a.mov(Reg::Rdi, Reg::R10);
    a.movi(Reg::Rsi, 4);
    a.sys(nr::STORAGE_RETURN);
    a.ret(); // cleanup resume ends here

    // serializer: expose the raw counter cell
    a.bind(ser_fn);
    a.movi_label(Reg::Rdi, cell);
    a.movi(Reg::Rsi, 4);
    a.sys(nr::STORAGE_RETURN);
    a.ret();

    // deserializer(len): receive into the counter cell
    a.bind(deser_fn);
    a.movi_label(Reg::Rdi, cell);
    a.movi(Reg::Rsi, 4);
    a.sys(nr::STORAGE_RETURN);
    a.ret();

    // get: call storage, render counter * multiplier in decimal (<=2 digits)
    a.bind(get_fn);
    let single = a.forward();
    let respond = a.forward();
    a.movi_label(Reg::Rdi, storage_fn);
    a.movi(Reg::Rsi, 0);
    a.movi(Reg::Rdx, 0);
    a.movi_label(Reg::Rcx, buf);
    a.movi(Reg::R8, 4);
    a.sys(nr::STORAGE_CALLV);
    a.movi_label(Reg::R10, buf);
    a.ldw(Reg::R11, Reg::R10, 0);
    a.muli(Reg::R11, multiplier);
    a.addi(Reg::R10, 8); // text area
    a.movi(Reg::R9, 10);
    a.jlt(Reg::R11, Reg::R9, single);
    a.mov(Reg::Rax, Reg::R11);
    a.divi(Reg::Rax, 10);
    a.addi(Reg::Rax, b'0' as i32);
    a.stb(Reg::R10, Reg::Rax, 0);
    a.mov(Reg::Rax, Reg::R11);
    a.modi(Reg::Rax, 10);
    a.addi(Reg::Rax, b'0' as i32);
    a.stb(Reg::R10, Reg::Rax, 1);
    a.movi(Reg::R11, 2);
    a.jmp(respond);
    a.bind(single);
    a.mov(Reg::Rax, Reg::R11);
    a.addi(Reg::Rax, b'0' as i32);
    a.stb(Reg::R10, Reg::Rax, 0);
    a.movi(Reg::R11, 1);
    a.bind(respond);
    emit_respond(&mut a, 200, ctype_l, TEXT_PLAIN.len() as u64);

    a.bind(cell);
    let _ = a.db(&[0u8; 8]);
    a.bind(buf);
    let _ = a.db(&[0u8; 16]);
    a.bind(ctype_l);
    let _ = a.db(TEXT_PLAIN.as_bytes());
    a.into_elf(boot)
}

/// Resume-style guest (no registered entries): advertises an inputs area
/// in RDI, loops on wait_for_requests, and answers with one digit from a
/// call counter. Warmup requests advance the counter pre-fork.
pub fn resume_counting_guest() -> Vec<u8> {
    let mut a = Asm::new(BASE);
    let boot = a.here();
    let inputs_buf = a.forward();
    let cell = a.forward();
    let ctype_l = a.forward();

    a.movi_label(Reg::Rdi, inputs_buf);
    let top = a.here();
    a.sys(nr::WAIT_FOR_REQUESTS);
    // resumed with the inputs struct written at [rdi]
    a.movi_label(Reg::R10, cell);
    a.ldw(Reg::R11, Reg::R10, 0);
    a.movi(Reg::R9, b'0' as u64);
    a.add(Reg::R9, Reg::R11);
    a.stb(Reg::R10, Reg::R9, 8);
    a.addi(Reg::R11, 1);
    a.stw(Reg::R10, Reg::R11, 0);
    a.addi(Reg::R10, 8);
    a.movi(Reg::R11, 1);
    emit_respond(&mut a, 200, ctype_l, TEXT_PLAIN.len() as u64);
    // harvested; the next catch-up run brings us back to waiting
    a.movi_label(Reg::Rdi, inputs_buf);
    a.jmp(top);

    a.bind(inputs_buf);
    let _ = a.db(&[0u8; 96]);
    a.bind(cell);
    let _ = a.db(&[0u8; 16]);
    a.bind(ctype_l);
    let _ = a.db(TEXT_PLAIN.as_bytes());
    a.into_elf(boot)
}

/// Guest exercising the HTTP header syscalls: echoes the X-Custom request
/// header and sets a response header.
pub fn header_guest() -> Vec<u8> {
    use fccore::syscalls::hdr;
    let mut a = Asm::new(BASE);
    let boot = a.here();
    let get_fn = a.forward();
    emit_boot(&mut a, &[(ProgramEntry::BackendGet, get_fn)]);

    a.bind(get_fn);
    let name_l = a.forward();
    let line_l = a.forward();
    let valbuf = a.forward();
    let ctype_l = a.forward();
    a.movi(Reg::Rdi, hdr::REQ);
    a.movi_label(Reg::Rsi, name_l);
    a.movi(Reg::Rdx, 8);
    a.movi_label(Reg::Rcx, valbuf);
    a.movi(Reg::R8, 64);
    a.sys(nr::HTTP_FIND);
    a.mov(Reg::R11, Reg::Rax);
    a.movi(Reg::Rdi, hdr::RESP);
    a.movi_label(Reg::Rsi, line_l);
    a.movi(Reg::Rdx, 11);
    a.sys(nr::HTTP_SET);
    a.movi_label(Reg::R10, valbuf);
    emit_respond(&mut a, 200, ctype_l, TEXT_PLAIN.len() as u64);

    a.bind(name_l);
    let _ = a.db(b"X-Custom");
    a.bind(line_l);
    let _ = a.db(b"X-Resp: yes");
    a.bind(valbuf);
    let _ = a.db(&[0u8; 64]);
    a.bind(ctype_l);
    let _ = a.db(TEXT_PLAIN.as_bytes());
    a.into_elf(boot)
}

/// Guest that compiles and runs a regex on its URL argument, answering
/// '1' or '0', and caches the handle across requests.
pub fn regex_guest(pattern: &str, subject: &str) -> Vec<u8> {
    let mut a = Asm::new(BASE);
    let boot = a.here();
    let get_fn = a.forward();
    emit_boot(&mut a, &[(ProgramEntry::BackendGet, get_fn)]);

    a.bind(get_fn);
    let pat_l = a.forward();
    let subj_l = a.forward();
    let out_l = a.forward();
    let ctype_l = a.forward();
    a.movi_label(Reg::Rdi, pat_l);
    a.movi(Reg::Rsi, pattern.len() as u64);
    a.sys(nr::REGEX_COMPILE);
    a.mov(Reg::Rdi, Reg::Rax);
    a.movi_label(Reg::Rsi, subj_l);
    a.movi(Reg::Rdx, subject.len() as u64);
    a.sys(nr::REGEX_MATCH);
    a.addi(Reg::Rax, b'0' as i32);
    a.movi_label(Reg::R10, out_l);
    a.stb(Reg::R10, Reg::Rax, 0);
    a.movi(Reg::R11, 1);
    emit_respond(&mut a, 200, ctype_l, TEXT_PLAIN.len() as u64);

    a.bind(pat_l);
    let _ = a.db(pattern.as_bytes());
    a.bind(subj_l);
    let _ = a.db(subject.as_bytes());
    a.bind(out_l);
    let _ = a.db(&[0u8; 8]);
    a.bind(ctype_l);
    let _ = a.db(TEXT_PLAIN.as_bytes());
    a.into_elf(boot)
}

/// Guest with a streaming POST consumer plus a POST responder that echoes
/// everything the stream callback accumulated.
pub fn stream_post_guest() -> Vec<u8> {
    let mut a = Asm::new(BASE);
    let boot = a.here();
    let stream_fn = a.forward();
    let post_fn = a.forward();
    emit_boot(
        &mut a,
        &[(ProgramEntry::BackendStream, stream_fn), (ProgramEntry::BackendPost, post_fn)],
    );

    // stream(url, arg, ctype, data, len, offset): copy into abuf+offset
    a.bind(stream_fn);
    let abuf = a.forward();
    let copy_top = a.forward();
    let copy_done = a.forward();
    a.mov(Reg::Rdi, Reg::Rcx); // src
    a.movi_label(Reg::R10, abuf);
    a.add(Reg::R10, Reg::R9); // dst = abuf + offset
    a.mov(Reg::R11, Reg::R8); // remaining
    a.bind(copy_top);
    a.jz(Reg::R11, copy_done);
    a.ldb(Reg::Rax, Reg::Rdi, 0);
    a.stb(Reg::R10, Reg::Rax, 0);
    a.addi(Reg::Rdi, 1);
    a.addi(Reg::R10, 1);
    a.addi(Reg::R11, -1);
    a.jmp(copy_top);
    a.bind(copy_done);
    a.mov(Reg::Rax, Reg::R8); // consumed everything
    a.ret();

    // on_post(url, arg, ctype, data=0, len=total): respond with abuf
    a.bind(post_fn);
    let ctype_l = a.forward();
    a.movi_label(Reg::R10, abuf);
    a.mov(Reg::R11, Reg::R8);
    emit_respond(&mut a, 200, ctype_l, TEXT_PLAIN.len() as u64);

    a.bind(abuf);
    let _ = a.db(&[0u8; 256]);
    a.bind(ctype_l);
    let _ = a.db(TEXT_PLAIN.as_bytes());
    a.into_elf(boot)
}

/// Guest that sets cache directives before a buffered response.
pub fn cacheable_guest() -> Vec<u8> {
    let mut a = Asm::new(BASE);
    let boot = a.here();
    let get_fn = a.forward();
    emit_boot(&mut a, &[(ProgramEntry::BackendGet, get_fn)]);

    a.bind(get_fn);
    let ctype_l = a.forward();
    let body_l = a.forward();
    a.movi(Reg::Rdi, 1);
    a.movi(Reg::Rsi, 60_000);
    a.movi(Reg::Rdx, 30_000);
    a.movi(Reg::Rcx, 0);
    a.sys(nr::SET_CACHEABLE);
    a.movi_label(Reg::R10, body_l);
    a.movi(Reg::R11, 6);
    emit_respond(&mut a, 200, ctype_l, TEXT_PLAIN.len() as u64);

    a.bind(ctype_l);
    let _ = a.db(TEXT_PLAIN.as_bytes());
    a.bind(body_l);
    let _ = a.db(b"cached");
    a.into_elf(boot)
}
