use burn::tensor::{activation, Distribution, Tensor};
use hlstmat::{NonLocalBlockConfig, SpatioTemporalCellConfig};

type TestBackend = burn_ndarray::NdArray<f32>;

fn run_affinity() {
    let device = Default::default();
    let block = NonLocalBlockConfig::new(8).init::<TestBackend>(&device);
    let grid: Tensor<TestBackend, 2> = Tensor::random([6, 8], Distribution::Default, &device);

    let theta = grid.clone().matmul(block.w_theta.val());
    let phi = grid.clone().matmul(block.w_phi.val());
    let affinity = activation::softmax(theta.matmul(phi.transpose()), 1);

    let drift = (affinity.sum_dim(1) - 1.0).abs().max().into_scalar();
    println!("Desviación máxima de las filas de afinidad: {:.2e}", drift);

    let out = block.forward_single(grid).unwrap();
    println!("Rejilla refinada: {:?}, |y| medio = {:.4}", out.dims(), out.abs().mean().into_scalar());
}

fn run_slices() {
    let device = Default::default();
    let block = NonLocalBlockConfig::new(8).init::<TestBackend>(&device);
    let volume: Tensor<TestBackend, 3> =
        Tensor::random([2, 12, 8], Distribution::Default, &device);

    let out = block.forward_sliced(volume.clone(), 3).unwrap();

    // Reemplazamos el corte central y medimos si los otros cortes cambian
    let edited = Tensor::cat(
        vec![
            volume.clone().slice([0..2, 0..4, 0..8]),
            Tensor::random([2, 4, 8], Distribution::Default, &device),
            volume.slice([0..2, 8..12, 0..8]),
        ],
        1,
    );
    let out_edited = block.forward_sliced(edited, 3).unwrap();

    let first = out.clone().slice([0..2, 0..4, 0..8]) - out_edited.clone().slice([0..2, 0..4, 0..8]);
    let last = out.slice([0..2, 8..12, 0..8]) - out_edited.slice([0..2, 8..12, 0..8]);
    let leak = first.abs().max().into_scalar().max(last.abs().max().into_scalar());
    println!("Fuga entre cortes temporales: {:.2e}", leak);
}

fn run_collapse() {
    let device = Default::default();
    let cell = SpatioTemporalCellConfig::new(8, 3, 2, 2).init::<TestBackend>(&device);
    let volume: Tensor<TestBackend, 4> =
        Tensor::random([2, 4, 3, 8], Distribution::Default, &device);

    let out = cell.forward(volume).unwrap();
    println!(
        "Volumen [2, 4, 3, 8] colapsado a {:?}; |h| medio = {:.4}",
        out.dims(),
        out.abs().mean().into_scalar()
    );
}

fn run_grad_input() {
    let device = Default::default();

    // Usamos Autodiff para medir el gradiente real
    type AtDiffBackend = burn::backend::Autodiff<TestBackend>;

    let block = NonLocalBlockConfig::new(8).init::<AtDiffBackend>(&device);
    let grids = Tensor::<AtDiffBackend, 3>::random([2, 6, 8], Distribution::Normal(0.0, 1.0), &device)
        .require_grad();

    let out = block.forward(grids.clone()).unwrap();
    let grads = out.sum().backward();
    let grid_grad = grids.grad(&grads).expect("Debe existir gradiente para la rejilla");
    println!(
        "Gradiente REAL medio |d y / d rejilla|: {:.6}",
        grid_grad.abs().mean().into_scalar()
    );
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() <= 1 {
        println!("Modo por defecto: ejecutar TODAS las pruebas de los bloques");
        run_affinity();
        run_slices();
        run_collapse();
        run_grad_input();
        return;
    }
    let mode = args[1].as_str();
    match mode {
        "afinidad" => run_affinity(),
        "cortes" => run_slices(),
        "colapso" => run_collapse(),
        "grad" => run_grad_input(),
        _ => {
            eprintln!("Modo inválido: {}", mode);
            eprintln!("Modos: afinidad | cortes | colapso | grad");
            std::process::exit(1);
        }
    }
}
