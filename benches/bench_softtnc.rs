#![feature(test)]

extern crate softtnc;
extern crate test;

use softtnc::ax25::Packet;
use softtnc::fcs::calc_crc;
use softtnc::fec::FecMode;
use softtnc::gen_tone::ToneGen;
use softtnc::modem::{Modem, ModemConfig};
use softtnc::rs::ReedSolomon;

use test::Bencher;

#[bench]
fn bench_crc(b: &mut Bencher) {
    let data = vec![0x5au8; 330];
    b.iter(|| calc_crc(test::black_box(&data)));
}

#[bench]
fn bench_rs_encode(b: &mut Bencher) {
    let rs = ReedSolomon::new(16);
    let data: Vec<u8> = (0..239u32).map(|i| (i * 7) as u8).collect();
    b.iter(|| rs.encode(test::black_box(&data)));
}

#[bench]
fn bench_rs_decode_with_errors(b: &mut Bencher) {
    let rs = ReedSolomon::new(16);
    let data: Vec<u8> = (0..239u32).map(|i| (i * 7) as u8).collect();
    let clean = rs.encode(&data);
    b.iter(|| {
        let mut cw = clean.clone();
        cw[10] ^= 0x55;
        cw[200] ^= 0xaa;
        rs.decode(&mut cw).unwrap()
    });
}

// One second of 1200 baud audio through the whole receive stack.
// This is the number that decides how many channels fit on a core.
#[bench]
fn bench_demod_one_second(b: &mut Bencher) {
    let cfg = ModemConfig::default();
    let p = Packet::from_monitor("WB2OSZ-5>APDW17,WIDE1-1:>bench").unwrap();
    let mut tg = ToneGen::new(&cfg);
    let mut audio = tg.packet_to_audio(&p.to_bytes(), FecMode::None);
    audio.resize(cfg.sample_rate as usize, 0);
    b.iter(|| {
        let mut m = Modem::new(0, &cfg);
        let mut out = m.process(test::black_box(&audio));
        out.extend(m.finish());
        assert_eq!(out.len(), 1);
    });
}
