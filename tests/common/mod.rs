#![allow(dead_code)]

use std::{
    collections::HashMap,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Result;
use half::bf16;
use rwkv_flow::ModelConfig;
use safetensors::{tensor::TensorView, Dtype};
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

/// A checkpoint parameter in `torch` layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct Checkpoint(pub Vec<Param>);

impl Checkpoint {
    pub fn get(&self, name: &str) -> Option<&Param> {
        self.0.iter().find(|x| x.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Param> {
        self.0.iter_mut().find(|x| x.name == name)
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|x| x.name != name);
    }

    pub fn push(&mut self, name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) {
        let name = name.into();
        assert_eq!(shape.iter().product::<usize>(), data.len(), "{name}");
        self.0.push(Param { name, shape, data });
    }

    /// Write the checkpoint as safetensors, storing values as `dtype` (`F32` or `BF16`).
    pub fn save(&self, path: impl AsRef<Path>, dtype: Dtype) -> Result<()> {
        let bytes: Vec<(String, Vec<usize>, Vec<u8>)> = self
            .0
            .iter()
            .map(|param| {
                let bytes = match dtype {
                    Dtype::BF16 => {
                        let data: Vec<bf16> = param.data.iter().map(|&x| bf16::from_f32(x)).collect();
                        bytemuck::cast_slice(&data).to_vec()
                    }
                    _ => bytemuck::cast_slice(&param.data).to_vec(),
                };
                (param.name.clone(), param.shape.clone(), bytes)
            })
            .collect();
        let views = bytes
            .iter()
            .map(|(name, shape, data)| Ok((name.clone(), TensorView::new(dtype, shape.clone(), data)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        std::fs::write(path, safetensors::serialize(&views, &None)?)?;
        Ok(())
    }
}

/// A minimal protocol 2 pickle writer covering what `torch.save` emits for a state dict.
#[derive(Debug, Default)]
struct Pickle(Vec<u8>);

impl Pickle {
    fn op(&mut self, op: u8) -> &mut Self {
        self.0.push(op);
        self
    }

    fn global(&mut self, module: &str, name: &str) -> &mut Self {
        self.0.push(b'c');
        self.0.extend_from_slice(format!("{module}\n{name}\n").as_bytes());
        self
    }

    fn string(&mut self, value: &str) -> &mut Self {
        self.0.push(b'X');
        self.0.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.0.extend_from_slice(value.as_bytes());
        self
    }

    fn int(&mut self, value: usize) -> &mut Self {
        self.0.push(b'J');
        self.0.extend_from_slice(&(value as i32).to_le_bytes());
        self
    }

    fn tuple(&mut self, values: &[usize]) -> &mut Self {
        self.op(b'(');
        for &x in values {
            self.int(x);
        }
        self.op(b't')
    }

    /// `collections.OrderedDict()`
    fn ordered_dict(&mut self) -> &mut Self {
        self.global("collections", "OrderedDict").op(b')').op(b'R')
    }
}

impl Checkpoint {
    /// Write the checkpoint the way `torch.save` lays out a state dict, one storage per tensor.
    ///
    /// Parameters named in `transposed` are stored column-major, as a transposed view would be.
    pub fn save_torch(&self, path: impl AsRef<Path>, dtype: Dtype, transposed: &[&str]) -> Result<()> {
        let storage = match dtype {
            Dtype::BF16 => "BFloat16Storage",
            Dtype::F16 => "HalfStorage",
            _ => "FloatStorage",
        };

        let mut pickle = Pickle::default();
        pickle.op(0x80).op(2).ordered_dict().op(b'(');
        let mut blobs = vec![];
        for (key, param) in self.0.iter().enumerate() {
            let column_major = transposed.contains(&param.name.as_str()) && param.shape.len() == 2;
            let (data, stride) = match column_major {
                true => {
                    let (rows, cols) = (param.shape[0], param.shape[1]);
                    let data = (0..rows * cols)
                        .map(|index| param.data[(index % rows) * cols + index / rows])
                        .collect::<Vec<_>>();
                    (data, vec![1, rows])
                }
                false => {
                    let mut stride = vec![1; param.shape.len()];
                    for axis in (0..param.shape.len().saturating_sub(1)).rev() {
                        stride[axis] = stride[axis + 1] * param.shape[axis + 1];
                    }
                    (param.data.clone(), stride)
                }
            };
            let bytes = match dtype {
                Dtype::BF16 => {
                    let data: Vec<bf16> = data.iter().map(|&x| bf16::from_f32(x)).collect();
                    bytemuck::cast_slice(&data).to_vec()
                }
                Dtype::F16 => {
                    let data: Vec<half::f16> = data.iter().map(|&x| half::f16::from_f32(x)).collect();
                    bytemuck::cast_slice(&data).to_vec()
                }
                _ => bytemuck::cast_slice(&data).to_vec(),
            };

            pickle
                .string(&param.name)
                .global("torch._utils", "_rebuild_tensor_v2")
                .op(b'(')
                .op(b'(')
                .string("storage")
                .global("torch", storage)
                .string(&key.to_string())
                .string("cpu")
                .int(data.len())
                .op(b't')
                .op(b'Q')
                .int(0)
                .tuple(&param.shape)
                .tuple(&stride)
                .op(0x89)
                .ordered_dict()
                .op(b't')
                .op(b'R');
            blobs.push((key, bytes));
        }
        pickle.op(b'u').op(b'}').op(b'b').op(b'.');

        let mut zip = ZipWriter::new(File::create(path)?);
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        zip.start_file("archive/data.pkl", options)?;
        zip.write_all(&pickle.0)?;
        for (key, bytes) in blobs {
            zip.start_file(format!("archive/data/{key}"), options)?;
            zip.write_all(&bytes)?;
        }
        zip.finish()?;
        Ok(())
    }
}

fn layer_params(
    checkpoint: &mut Checkpoint,
    index: usize,
    num_emb: usize,
    mut vector: impl FnMut(usize) -> Vec<f32>,
    mut matrix: impl FnMut(usize, usize) -> Vec<f32>,
) {
    let c = num_emb;
    let h = 4 * c;
    let p = format!("blocks.{index}");
    let norms = match index {
        0 => vec!["ln0", "ln1", "ln2"],
        _ => vec!["ln1", "ln2"],
    };
    for norm in norms {
        checkpoint.push(format!("{p}.{norm}.weight"), vec![c], vector(c).iter().map(|x| x + 1.0).collect());
        checkpoint.push(format!("{p}.{norm}.bias"), vec![c], vector(c));
    }
    checkpoint.push(format!("{p}.att.time_decay"), vec![c], vector(c));
    checkpoint.push(format!("{p}.att.time_first"), vec![c], vector(c));
    for mix in ["k", "v", "r"] {
        let data = vector(c).iter().map(|x| x * 0.5 + 0.5).collect();
        checkpoint.push(format!("{p}.att.time_mix_{mix}"), vec![1, 1, c], data);
    }
    for name in ["key", "value", "receptance", "output"] {
        checkpoint.push(format!("{p}.att.{name}.weight"), vec![c, c], matrix(c, c));
    }
    for mix in ["k", "r"] {
        let data = vector(c).iter().map(|x| x * 0.5 + 0.5).collect();
        checkpoint.push(format!("{p}.ffn.time_mix_{mix}"), vec![1, 1, c], data);
    }
    checkpoint.push(format!("{p}.ffn.key.weight"), vec![h, c], matrix(h, c));
    checkpoint.push(format!("{p}.ffn.value.weight"), vec![c, h], matrix(c, h));
    checkpoint.push(format!("{p}.ffn.receptance.weight"), vec![c, c], matrix(c, c));
}

/// A checkpoint of small random weights. Values are multiples of 1/64 so they survive `bf16`.
pub fn random_checkpoint(num_emb: usize, num_layer: usize, num_vocab: usize, seed: u64) -> Checkpoint {
    let rng = std::cell::RefCell::new(fastrand::Rng::with_seed(seed));
    let value = || (rng.borrow_mut().i32(-32..32) as f32) / 64.0;
    let vector = |len: usize| (0..len).map(|_| value()).collect::<Vec<_>>();

    let mut checkpoint = Checkpoint::default();
    checkpoint.push("emb.weight", vec![num_vocab, num_emb], vector(num_vocab * num_emb));
    checkpoint.push("head.weight", vec![num_vocab, num_emb], vector(num_vocab * num_emb));
    checkpoint.push("ln_out.weight", vec![num_emb], vector(num_emb).iter().map(|x| x + 1.0).collect());
    checkpoint.push("ln_out.bias", vec![num_emb], vector(num_emb));
    for index in 0..num_layer {
        layer_params(&mut checkpoint, index, num_emb, vector, |num_out, num_in| {
            vector(num_out * num_in)
        });
    }
    checkpoint
}

/// A single-layer checkpoint whose greedy continuation of token `i` is `next(i)`.
pub fn transition_checkpoint(num_vocab: usize, next: impl Fn(usize) -> usize) -> Checkpoint {
    let c = num_vocab;
    let mut emb = vec![0.0; c * c];
    let mut head = vec![0.0; c * c];
    for token in 0..c {
        emb[token * c + token] = 1.0;
        head[next(token) * c + token] = 1.0;
    }

    let mut checkpoint = Checkpoint::default();
    checkpoint.push("emb.weight", vec![c, c], emb);
    checkpoint.push("head.weight", vec![c, c], head);
    checkpoint.push("ln_out.weight", vec![c], vec![1.0; c]);
    checkpoint.push("ln_out.bias", vec![c], vec![0.0; c]);
    layer_params(&mut checkpoint, 0, c, |len| vec![0.0; len], |num_out, num_in| {
        vec![0.0; num_out * num_in]
    });
    checkpoint
}

pub fn temp_dir(name: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("rwkv-flow-test-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn write_config(dir: impl AsRef<Path>, config: &ModelConfig) -> Result<()> {
    let path = dir.as_ref().join("config.json");
    std::fs::write(path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}
