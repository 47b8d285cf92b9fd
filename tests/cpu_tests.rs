use ferrokern::backend::DeviceType;
use ferrokern::future::StatsFuture;
use ferrokern::ops::cpu;
use ferrokern::ops::{ChannelShuffle, ExecContext, Slice};
use ferrokern::runtime::{AffinityPolicy, CpuExecutor, ThreadPolicy};
use ferrokern::tensors::{Element, Tensor};
use rand::Rng;

#[derive(Debug, Clone, Default, PartialEq)]
struct Label(String);

impl Element for Label {}

fn random_tensor(shape: &[usize]) -> Tensor<f32> {
    let mut rng = rand::rng();
    let len = shape.iter().product();
    Tensor::new(shape.to_vec(), (0..len).map(|_| rng.random_range(-10.0..10.0)).collect())
}

/// Joins `parts` back together along `axis`.
fn concat<T: Element>(parts: &[Tensor<T>], axis: usize) -> Vec<T> {
    let shape = parts[0].shape();
    let outer: usize = shape[..axis].iter().product();
    let run: usize = shape[axis..].iter().product();
    let mut out = Vec::new();
    for o in 0..outer {
        for part in parts {
            out.extend_from_slice(&part.data().unwrap()[o * run..(o + 1) * run]);
        }
    }
    out
}

#[test]
fn slice_then_concat_is_identity() {
    let ctx = ExecContext::cpu_only(&ThreadPolicy::default().with_threads(2)).unwrap();
    let input = random_tensor(&[1, 4, 4, 8]);
    let mut slice = Slice::<f32>::new(DeviceType::Cpu, 3, &ctx);
    let mut outputs = vec![Tensor::empty(), Tensor::empty()];
    slice.run(&input, &mut outputs, None).unwrap();

    for output in &outputs {
        assert_eq!(output.shape(), &[1, 4, 4, 4]);
    }
    let joined = concat(&outputs, 3);
    let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&joined), bits(input.data().unwrap()));
}

#[test]
fn slice_on_every_axis() {
    let input = Tensor::new(vec![2, 4, 6], (0..48).collect::<Vec<i64>>());
    for (axis, parts) in [(0, 2), (1, 4), (2, 3)] {
        let mut outputs = vec![Tensor::empty(); parts];
        cpu::slice(&input, axis, &mut outputs).unwrap();
        assert_eq!(concat(&outputs, axis), input.data().unwrap());
    }
}

#[test]
fn slice_truncates_uneven_splits() {
    let input = Tensor::new(vec![1, 7], (0..7).collect::<Vec<u16>>());
    let mut outputs = vec![Tensor::empty(); 3];
    cpu::slice(&input, 1, &mut outputs).unwrap();
    assert_eq!(outputs[0].data().unwrap(), &[0, 1]);
    assert_eq!(outputs[1].data().unwrap(), &[2, 3]);
    assert_eq!(outputs[2].data().unwrap(), &[4, 5]);
}

#[test]
fn slice_into_more_parts_than_channels_yields_empty_outputs() {
    let input = Tensor::new(vec![2, 2], vec![1u8, 2, 3, 4]);
    let mut outputs = vec![Tensor::empty(); 3];
    cpu::slice(&input, 1, &mut outputs).unwrap();
    assert!(outputs.iter().all(|o| o.shape() == &[2, 0] && o.is_empty()));
}

#[test]
fn slice_rejects_bad_arguments() {
    let input = Tensor::new(vec![2, 2], vec![1u8, 2, 3, 4]);
    let mut none: Vec<Tensor<u8>> = Vec::new();
    assert!(cpu::slice(&input, 0, &mut none).is_err());
    let mut two = vec![Tensor::empty(); 2];
    assert!(cpu::slice(&input, 2, &mut two).is_err());
}

#[test]
fn opaque_elements_are_cloned() {
    let words = ["a", "b", "c", "d", "e", "f"];
    let input = Tensor::new(vec![3, 2], words.iter().map(|w| Label(w.to_string())).collect());
    let mut outputs = vec![Tensor::empty(), Tensor::empty()];
    cpu::slice(&input, 1, &mut outputs).unwrap();
    let first: Vec<&str> = outputs[0].data().unwrap().iter().map(|l| l.0.as_str()).collect();
    assert_eq!(first, ["a", "c", "e"]);

    let pixels = Tensor::new(vec![1, 1, 1, 4], words[..4].iter().map(|w| Label(w.to_string())).collect());
    let mut shuffled = Tensor::empty();
    cpu::channel_shuffle(&pixels, 2, &mut shuffled).unwrap();
    let got: Vec<&str> = shuffled.data().unwrap().iter().map(|l| l.0.as_str()).collect();
    assert_eq!(got, ["a", "c", "b", "d"]);
}

#[test]
fn channel_shuffle_twice_with_transposed_groups_restores_input() {
    // 12 channels as 3 groups of 4, then 4 groups of 3
    let input = random_tensor(&[2, 3, 3, 12]);
    let mut once = Tensor::empty();
    let mut twice = Tensor::empty();
    cpu::channel_shuffle(&input, 3, &mut once).unwrap();
    cpu::channel_shuffle(&once, 4, &mut twice).unwrap();
    assert_eq!(twice, input);
}

#[test]
fn channel_shuffle_functor_records_timing() {
    let ctx = ExecContext::cpu_only(&ThreadPolicy::default()).unwrap();
    let mut shuffle = ChannelShuffle::<i32>::new(DeviceType::Cpu, 2, &ctx);
    assert_eq!(shuffle.device_type(), DeviceType::Cpu);
    assert!(shuffle.as_gpu().is_none());

    let input = Tensor::new(vec![1, 1, 2, 4], vec![0, 1, 2, 3, 4, 5, 6, 7]);
    let mut output = Tensor::empty();
    let mut future = StatsFuture::new();
    shuffle.run(&input, &mut output, Some(&mut future)).unwrap();
    assert_eq!(output.data().unwrap(), &[0, 2, 1, 3, 4, 6, 5, 7]);
    assert!(future.stats().is_some());
}

#[test]
fn channel_shuffle_rejects_indivisible_groups() {
    let input = Tensor::new(vec![1, 1, 1, 5], vec![0u32; 5]);
    let mut output = Tensor::empty();
    assert!(cpu::channel_shuffle(&input, 2, &mut output).is_err());
    assert!(cpu::channel_shuffle(&input, 0, &mut output).is_err());
    let flat = Tensor::new(vec![4], vec![0u32; 4]);
    assert!(cpu::channel_shuffle(&flat, 2, &mut output).is_err());
}

#[test]
fn thread_policy_controls_pool_size() {
    let pool = CpuExecutor::new(&ThreadPolicy::default().with_threads(3)).unwrap();
    assert_eq!(pool.num_threads(), 3);
    assert_eq!(pool.install(rayon::current_num_threads), 3);

    let pinned = ThreadPolicy::default()
        .with_affinity(AffinityPolicy::BigOnly)
        .with_cpu_ids(vec![0, 1]);
    assert_eq!(pinned.resolved_threads(), 2);
    assert_eq!(CpuExecutor::new(&pinned).unwrap().num_threads(), 2);
}
