use burn::tensor::{Distribution, Tensor, TensorData};
use hlstmat::{AttentiveCellConfig, CellState, GatedCellConfig};
use rand::Rng;

type TestBackend = burn_ndarray::NdArray<f32>;

fn run_equivalence() {
    let device = Default::default();
    let batch_size = 2;
    let seq_len = 7;
    let input_size = 16;
    let dim = 32;
    let cell = GatedCellConfig::new(input_size, dim).init::<TestBackend>(&device);
    let input_seq: Tensor<TestBackend, 3> =
        Tensor::random([batch_size, seq_len, input_size], Distribution::Default, &device);

    let (hidden_run, memory_run) = cell.run(input_seq.clone(), None, None).unwrap();

    let projected = cell.project_input_seq(input_seq);
    let mut state = CellState::zeros(batch_size, dim, &device);
    let mut hiddens: Vec<Tensor<TestBackend, 3>> = Vec::with_capacity(seq_len);
    let mut memories: Vec<Tensor<TestBackend, 3>> = Vec::with_capacity(seq_len);
    for t in 0..seq_len {
        let input_t = projected
            .clone()
            .slice([0..batch_size, t..(t + 1), 0..(3 * dim)])
            .squeeze(1);
        state = cell.step(None, input_t, &state);
        hiddens.push(state.hidden.clone().unsqueeze_dim(1));
        memories.push(state.memory.clone().unsqueeze_dim(1));
    }
    let hidden_steps: Tensor<TestBackend, 3> = Tensor::cat(hiddens, 1);
    let memory_steps: Tensor<TestBackend, 3> = Tensor::cat(memories, 1);

    let diff = (hidden_run - hidden_steps).abs().mean().into_scalar();
    println!("Diferencia media en outputs: {:.2e}", diff);
    let memory_diff = (memory_run - memory_steps).abs().mean().into_scalar();
    println!("Diferencia media en memorias: {:.2e}", memory_diff);
}

fn run_attention() {
    let device = Default::default();
    let batch_size = 2;
    let seq_len = 5;
    let cell = AttentiveCellConfig::new(16, 32, 24).init::<TestBackend>(&device);
    let input_seq: Tensor<TestBackend, 3> =
        Tensor::random([batch_size, seq_len, 16], Distribution::Default, &device);
    let context: Tensor<TestBackend, 3> =
        Tensor::random([batch_size, 7, 24], Distribution::Default, &device);

    let out = cell.run(input_seq, None, Some(&context), None).unwrap();

    let alpha_drift = (out.alpha.sum_dim(2) - 1.0).abs().max().into_scalar();
    println!("Desviación máxima de la suma de alfas: {:.2e}", alpha_drift);
    let sel_min = out.selector.clone().min().into_scalar();
    let sel_max = out.selector.max().into_scalar();
    println!("Selector en [{:.4}, {:.4}]", sel_min, sel_max);
}

fn run_mask_freeze() {
    let device = Default::default();
    let batch_size = 6;
    let seq_len = 9;
    let dim = 16;
    let cell = GatedCellConfig::new(8, dim).init::<TestBackend>(&device);
    let input_seq: Tensor<TestBackend, 3> =
        Tensor::random([batch_size, seq_len, 8], Distribution::Default, &device);

    // Longitudes aleatorias por muestra; el resto de la secuencia es relleno
    let mut rng = rand::rng();
    let mut lengths: Vec<usize> = Vec::with_capacity(batch_size);
    let mut mask_data: Vec<f32> = Vec::with_capacity(batch_size * seq_len);
    for _ in 0..batch_size {
        let len = rng.random_range(1..=seq_len);
        lengths.push(len);
        for t in 0..seq_len {
            mask_data.push(if t < len { 1.0 } else { 0.0 });
        }
    }
    let mask = Tensor::<TestBackend, 2>::from_data(
        TensorData::new(mask_data, [batch_size, seq_len]),
        &device,
    );

    let (_, memory_seq) = cell.run(input_seq, Some(&mask), None).unwrap();

    let mut frozen = 0usize;
    for (n, len) in lengths.iter().enumerate() {
        let at_end = memory_seq
            .clone()
            .slice([n..(n + 1), (len - 1)..*len, 0..dim]);
        let at_last = memory_seq
            .clone()
            .slice([n..(n + 1), (seq_len - 1)..seq_len, 0..dim]);
        let diff = (at_end - at_last).abs().max().into_scalar();
        if diff < 1e-6 {
            frozen += 1;
        }
    }
    println!(
        "Muestras con memoria congelada tras el fin de secuencia: {}/{}",
        frozen, batch_size
    );
}

fn run_grad_input() {
    let device = Default::default();
    let batch_size = 1;
    let seq_len = 6;
    let input_size = 8;
    let dim = 16;

    // Usamos Autodiff para medir el gradiente real
    type AtDiffBackend = burn::backend::Autodiff<TestBackend>;

    let cell = AttentiveCellConfig::new(input_size, dim, 12).init::<AtDiffBackend>(&device);
    let x = Tensor::<AtDiffBackend, 3>::random(
        [batch_size, seq_len, input_size],
        Distribution::Normal(0.0, 1.0),
        &device,
    )
    .require_grad();
    let context =
        Tensor::<AtDiffBackend, 3>::random([batch_size, 5, 12], Distribution::Default, &device);

    let out = cell.run(x.clone(), None, Some(&context), None).unwrap();
    let h_last = out
        .hidden
        .slice([0..batch_size, (seq_len - 1)..seq_len, 0..dim])
        .sum();

    let grads = h_last.backward();
    let x_grad = x.grad(&grads).expect("Debe existir gradiente para la entrada");
    let grad_val = x_grad.abs().mean().into_scalar();

    println!("Gradiente REAL medio |d last / d x|: {:.6}", grad_val);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() <= 1 {
        println!("Modo por defecto: ejecutar TODAS las pruebas de las celdas");
        run_equivalence();
        run_attention();
        run_mask_freeze();
        run_grad_input();
        return;
    }
    let mode = args[1].as_str();
    match mode {
        "equiv" => run_equivalence(),
        "atencion" => run_attention(),
        "mask" => run_mask_freeze(),
        "grad" => run_grad_input(),
        _ => {
            eprintln!("Modo inválido: {}", mode);
            eprintln!("Modos: equiv | atencion | mask | grad");
            std::process::exit(1);
        }
    }
}
