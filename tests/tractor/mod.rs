mod cycle;
mod queries;
mod runner;
