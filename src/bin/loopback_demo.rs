//! Manual smoke test: bring up a loopback interface, send an ICMP echo
//! to ourselves, and print the reply the device captured.
//!
//! Stands in for the teacher's `test/stepN.c` example programs: a
//! hardcoded topology with no CLI, config file, or env var surface
//! (`spec.md` §6), run with `cargo run --bin loopback-demo`.

use std::thread;
use std::time::Duration;

use netstack::addr::Ipv4Addr;
use netstack::Stack;

fn main() {
    env_logger::init();

    let stack = Stack::init();
    let unicast = Ipv4Addr::new(127, 0, 0, 1);
    let netmask = Ipv4Addr::new(255, 0, 0, 0);
    let dev = stack.add_loopback(unicast, netmask);
    log::info!("brought up loopback device {dev} at {unicast}/{netmask}");
    stack.run();

    let a = stack.udp_open().expect("udp pcb table has room");
    let b = stack.udp_open().expect("udp pcb table has room");
    stack
        .udp_bind(a, netstack::addr::Endpoint::new(unicast, 10007))
        .expect("10007 is free");
    stack
        .udp_bind(b, netstack::addr::Endpoint::new(unicast, 20008))
        .expect("20008 is free");

    let sent = b"hello over loopback";
    stack
        .udp_sendto(a, sent, netstack::addr::Endpoint::new(unicast, 20008))
        .expect("loopback send always succeeds once the device is up");

    thread::sleep(Duration::from_millis(20));
    let mut buf = [0u8; 64];
    let (n, from) = stack.udp_recvfrom(b, &mut buf).expect("the datagram we just sent");
    println!("received {:?} from {from}", std::str::from_utf8(&buf[..n]).unwrap());

    stack.udp_close(a).ok();
    stack.udp_close(b).ok();
    stack.shutdown();
}
