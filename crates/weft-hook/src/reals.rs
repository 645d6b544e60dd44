//! Original-symbol table
//!
//! One `RealSymbol` per interposed function, resolved through
//! `dlsym(RTLD_NEXT)` so the shims can reach the definition they shadow.

use weft_io::reals::RealSymbol;

pub static SLEEP: RealSymbol = RealSymbol::new("sleep\0");
pub static USLEEP: RealSymbol = RealSymbol::new("usleep\0");
pub static NANOSLEEP: RealSymbol = RealSymbol::new("nanosleep\0");
pub static SOCKET: RealSymbol = RealSymbol::new("socket\0");
pub static CONNECT: RealSymbol = RealSymbol::new("connect\0");
pub static ACCEPT: RealSymbol = RealSymbol::new("accept\0");
pub static READ: RealSymbol = RealSymbol::new("read\0");
pub static READV: RealSymbol = RealSymbol::new("readv\0");
pub static RECV: RealSymbol = RealSymbol::new("recv\0");
pub static RECVFROM: RealSymbol = RealSymbol::new("recvfrom\0");
pub static RECVMSG: RealSymbol = RealSymbol::new("recvmsg\0");
pub static WRITE: RealSymbol = RealSymbol::new("write\0");
pub static WRITEV: RealSymbol = RealSymbol::new("writev\0");
pub static SEND: RealSymbol = RealSymbol::new("send\0");
pub static SENDTO: RealSymbol = RealSymbol::new("sendto\0");
pub static SENDMSG: RealSymbol = RealSymbol::new("sendmsg\0");
pub static FCNTL: RealSymbol = RealSymbol::new("fcntl\0");
pub static IOCTL: RealSymbol = RealSymbol::new("ioctl\0");
pub static CLOSE: RealSymbol = RealSymbol::new("close\0");
pub static SETSOCKOPT: RealSymbol = RealSymbol::new("setsockopt\0");
pub static GETSOCKOPT: RealSymbol = RealSymbol::new("getsockopt\0");

/// Force resolution of every symbol in the table.
pub fn resolve_all() {
    let all: [&RealSymbol; 21] = [
        &SLEEP, &USLEEP, &NANOSLEEP, &SOCKET, &CONNECT, &ACCEPT, &READ, &READV, &RECV,
        &RECVFROM, &RECVMSG, &WRITE, &WRITEV, &SEND, &SENDTO, &SENDMSG, &FCNTL, &IOCTL,
        &CLOSE, &SETSOCKOPT, &GETSOCKOPT,
    ];
    for sym in all {
        sym.get();
    }
}
