use crate::tensor::cache::ResourcePool;

/// Scratch buffers for running the stack over up to `num_token` tokens at once.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub num_token: usize,
    pub num_emb: usize,
    pub num_hidden: usize,

    pub att_x: Vec<f32>,
    pub att_kx: Vec<f32>,
    pub att_vx: Vec<f32>,
    pub att_rx: Vec<f32>,
    pub att_k: Vec<f32>,
    pub att_v: Vec<f32>,
    pub att_r: Vec<f32>,
    pub att_o: Vec<f32>,

    pub ffn_x: Vec<f32>,
    pub ffn_kx: Vec<f32>,
    pub ffn_rx: Vec<f32>,
    pub ffn_k: Vec<f32>,
    pub ffn_v: Vec<f32>,
    pub ffn_r: Vec<f32>,
}

impl Runtime {
    pub fn new(num_token: usize, num_emb: usize, num_hidden: usize) -> Self {
        let emb = vec![0.0; num_token * num_emb];
        let hidden = vec![0.0; num_token * num_hidden];
        Self {
            num_token,
            num_emb,
            num_hidden,
            att_x: emb.clone(),
            att_kx: emb.clone(),
            att_vx: emb.clone(),
            att_rx: emb.clone(),
            att_k: emb.clone(),
            att_v: emb.clone(),
            att_r: emb.clone(),
            att_o: emb.clone(),
            ffn_x: emb.clone(),
            ffn_kx: emb.clone(),
            ffn_rx: emb.clone(),
            ffn_k: hidden,
            ffn_v: emb.clone(),
            ffn_r: emb,
        }
    }
}

/// Key of a [`Runtime`] in the pool: its token capacity.
pub type RuntimeKey = usize;

/// Per-request owner of every scratch [`Runtime`] a request checks out.
///
/// Buffers go back to the model's pool on [`Arena::release_all`] or when the arena is dropped,
/// whichever comes first.
#[derive(Debug)]
pub struct Arena {
    pool: ResourcePool<RuntimeKey, Runtime>,
    num_emb: usize,
    num_hidden: usize,
    runtimes: Vec<Runtime>,
}

impl Arena {
    pub fn new(pool: ResourcePool<RuntimeKey, Runtime>, num_emb: usize, num_hidden: usize) -> Self {
        Self {
            pool,
            num_emb,
            num_hidden,
            runtimes: vec![],
        }
    }

    /// Get a runtime that holds at least `num_token` tokens, reusing one this arena already owns.
    pub fn checkout(&mut self, num_token: usize) -> &mut Runtime {
        let capacity = num_token.max(1).next_power_of_two();
        let index = match self
            .runtimes
            .iter()
            .position(|runtime| runtime.num_token == capacity)
        {
            Some(index) => index,
            None => {
                let (num_emb, num_hidden) = (self.num_emb, self.num_hidden);
                let runtime = self
                    .pool
                    .checkout(capacity, || Runtime::new(capacity, num_emb, num_hidden));
                self.runtimes.push(runtime);
                self.runtimes.len() - 1
            }
        };
        &mut self.runtimes[index]
    }

    /// Number of runtimes currently held.
    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }

    /// Hand every held runtime back to the pool.
    pub fn release_all(&mut self) {
        if self.runtimes.is_empty() {
            return;
        }
        let count = self.runtimes.len();
        for runtime in self.runtimes.drain(..) {
            self.pool.release(runtime.num_token, runtime);
        }
        log::trace!("arena released {count} runtime(s), {} idle", self.pool.idle());
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.release_all();
    }
}
