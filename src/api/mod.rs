pub mod beatoven;
pub mod gemini;
pub mod stock;
