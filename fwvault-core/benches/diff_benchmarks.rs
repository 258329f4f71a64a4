/*!
Benchmarks for configuration normalization and diffing.
Large FortiOS exports run to tens of thousands of lines, so both steps sit
on the hot path of every backup job.
*/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fwvault_core::device::DeviceKind;
use fwvault_core::diff::diff_contents;
use fwvault_core::normalize::Normalizer;

// Firewall export with the given number of address objects
fn generate_config(objects: usize) -> String {
    let mut out = String::from(
        "#config-version=FGT60F-7.2.5-FW-build1517-230606:opmode=0:vdom=0:user=admin\n\
         #conf_file_ver=3141592653\n\
         #buildno=1517\n\
         config system global\n    set hostname \"bench\"\nend\n",
    );
    out.push_str("config firewall address\n");
    for i in 0..objects {
        out.push_str(&format!(
            "    edit \"host-{i}\"\n        set subnet 10.{}.{}.0 255.255.255.0\n        set comment \"updated 2024-01-01 12:00:00\"\n    next\n",
            (i / 256) % 256,
            i % 256
        ));
    }
    out.push_str("end\nconfig user local\n    edit \"ops\"\n        set passwd ENC AAAABBBBCCCC\n    next\nend\n");
    out
}

// Same export with a few subnets widened
fn mutate(config: &str) -> String {
    config
        .lines()
        .enumerate()
        .map(|(n, line)| {
            if n % 400 == 8 && line.contains("set subnet") {
                line.replace("255.255.255.0", "255.255.0.0")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");
    let normalizer = Normalizer::for_kind(DeviceKind::Fortigate);

    for objects in [100, 1_000, 10_000] {
        let config = generate_config(objects);
        group.throughput(Throughput::Bytes(config.len() as u64));
        group.bench_with_input(BenchmarkId::new("fortigate", objects), &config, |b, config| {
            b.iter(|| normalizer.normalize(black_box(config)))
        });
    }
    group.finish();
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff");

    for objects in [100, 1_000, 10_000] {
        let old = generate_config(objects);
        let new = mutate(&old);
        group.throughput(Throughput::Bytes((old.len() + new.len()) as u64));

        group.bench_with_input(BenchmarkId::new("identical", objects), &old, |b, old| {
            b.iter(|| diff_contents(DeviceKind::Fortigate, black_box(old), black_box(old)))
        });
        group.bench_with_input(
            BenchmarkId::new("changed", objects),
            &(old.clone(), new),
            |b, (old, new)| {
                b.iter(|| diff_contents(DeviceKind::Fortigate, black_box(old), black_box(new)))
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_normalize, bench_diff);
criterion_main!(benches);
